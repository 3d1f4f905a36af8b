// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The task table and the operations that change a task's life-cycle.
//!
//! The table is a fixed array of `Task` slots, allocated once at boot and
//! addressed by index. Slot 0 is the root task and is never freed. A slot
//! moves through
//!
//! ```text
//!   free --create--> USED --set executing--> USED|EXECUTING --delete--> free
//! ```
//!
//! and nothing in here ever zeroes or reclaims the memory a task was using;
//! that's the creator's business.

use abi::{FaultInfo, Priority, TaskFlags, ROOT_SLOT};
use kerncore::{
    compute_region, AccessPolicy, MemoryClass, RegionDesc, RegionError,
};

use crate::frame::{self, Injection};

/// How many injected calls a task can have outstanding at once.
pub const MAX_INJECTIONS: usize = 4;

/// Memory regions that follow a task around, in the order they're loaded.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TaskRegions {
    pub code: RegionDesc,
    pub data: RegionDesc,
    pub stack_guard: RegionDesc,
}

impl TaskRegions {
    pub const EMPTY: Self = Self {
        code: RegionDesc::DISABLED,
        data: RegionDesc::DISABLED,
        stack_guard: RegionDesc::DISABLED,
    };

    pub fn as_array(&self) -> [RegionDesc; 3] {
        [self.code, self.data, self.stack_guard]
    }
}

/// A base/size pair, before it's been encoded.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Span {
    pub base: u32,
    pub size: u32,
}

/// Internal representation of a task slot.
#[derive(Clone, Debug)]
pub struct Task {
    /// Saved stack pointer. Only meaningful while the task isn't running.
    sp: usize,
    flags: TaskFlags,
    pid: u32,
    /// Slot of the task that created this one.
    parent: usize,
    priority: Priority,
    /// Slice-timer counts left in this task's current slice.
    budget: u32,
    /// Total slice-timer counts this task has been charged. Never decreases.
    runtime: u64,
    regions: TaskRegions,
    /// Opaque runtime blocks owned by the task's language runtime. A thread
    /// whose own block is its process's block is thread zero.
    reent: usize,
    global_reent: usize,
    /// Lowest address of the task's stack.
    stack_base: usize,
    /// Address just past the top of the task's stack.
    stack_top: usize,
    /// Last fault taken, if the task was stopped by one.
    fault: Option<FaultInfo>,
    /// Injected calls that haven't come back through `Restore` yet, oldest
    /// first. Only the first `injected` entries mean anything.
    injections: [Injection; MAX_INJECTIONS],
    injected: usize,
}

impl Task {
    pub const EMPTY: Self = Self {
        sp: 0,
        flags: TaskFlags::empty(),
        pid: 0,
        parent: ROOT_SLOT,
        priority: Priority(0xFF),
        budget: 0,
        runtime: 0,
        regions: TaskRegions::EMPTY,
        reent: 0,
        global_reent: 0,
        stack_base: 0,
        stack_top: 0,
        fault: None,
        injections: [Injection::NONE; MAX_INJECTIONS],
        injected: 0,
    };

    pub fn flags(&self) -> TaskFlags {
        self.flags
    }

    pub fn is_used(&self) -> bool {
        self.flags.contains(TaskFlags::USED)
    }

    pub fn is_root(&self) -> bool {
        self.flags.contains(TaskFlags::IS_ROOT)
    }

    pub fn is_fifo(&self) -> bool {
        self.flags.contains(TaskFlags::IS_FIFO)
    }

    /// Checks whether the scheduler may pick this task at all.
    pub fn is_executing(&self) -> bool {
        self.flags.contains(TaskFlags::USED | TaskFlags::EXECUTING)
    }

    /// Starting a task again forgets its last fault.
    pub fn set_executing(&mut self, on: bool) {
        if self.is_used() {
            self.flags.set(TaskFlags::EXECUTING, on);
            if on {
                self.fault = None;
            }
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn parent(&self) -> usize {
        self.parent
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, p: Priority) {
        self.priority = p;
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    pub fn runtime(&self) -> u64 {
        self.runtime
    }

    /// Takes `ticks` out of the budget and adds them to the runtime.
    pub fn charge(&mut self, ticks: u32) {
        self.budget = self.budget.saturating_sub(ticks);
        self.runtime += u64::from(ticks);
    }

    pub fn reload_budget(&mut self, slice: u32) {
        self.budget = slice;
    }

    pub fn regions(&self) -> &TaskRegions {
        &self.regions
    }

    pub fn saved_sp(&self) -> usize {
        self.sp
    }

    pub fn set_saved_sp(&mut self, sp: usize) {
        self.sp = sp;
    }

    pub fn stack_base(&self) -> usize {
        self.stack_base
    }

    pub fn stack_top(&self) -> usize {
        self.stack_top
    }

    /// Lowest address the kernel may save registers to on this task's
    /// behalf: the bottom of its stack, or the top of its stack guard if
    /// the guard sits inside the stack.
    pub fn save_floor(&self) -> usize {
        let guard = &self.regions.stack_guard;
        if !guard.is_enabled() {
            return self.stack_base;
        }
        let end = u64::from(guard.base()) + guard.size();
        match usize::try_from(end) {
            Ok(end) if end > self.stack_base && end <= self.stack_top => end,
            _ => self.stack_base,
        }
    }

    pub fn reentrancy(&self) -> usize {
        self.reent
    }

    pub fn global_reentrancy(&self) -> usize {
        self.global_reent
    }

    /// Thread zero is the process task itself, whose runtime block is its
    /// process's. A secondary thread never is, whatever blocks it was given.
    pub fn is_thread_zero(&self) -> bool {
        self.is_used()
            && !self.flags.contains(TaskFlags::IS_THREAD)
            && self.reent == self.global_reent
    }

    pub fn fault(&self) -> Option<FaultInfo> {
        self.fault
    }

    /// Records `fault` and takes the task out of scheduling.
    ///
    /// Whatever calls were injected are forgotten; the contexts they would
    /// have returned to are no longer trustworthy.
    pub fn force_fault(&mut self, fault: FaultInfo) {
        self.fault = Some(fault);
        self.flags.remove(TaskFlags::EXECUTING);
        self.injected = 0;
    }

    /// Moves the saved context somewhere else entirely, dropping any
    /// outstanding injections with the old one.
    pub fn replace_saved_sp(&mut self, sp: usize) {
        self.sp = sp;
        self.injected = 0;
    }

    /// Remembers an injected call so `Restore` can find its way back.
    /// Returns `false`, changing nothing, if too many are outstanding.
    pub fn push_injection(&mut self, injection: Injection) -> bool {
        match self.injections.get_mut(self.injected) {
            Some(slot) => {
                *slot = injection;
                self.injected += 1;
                true
            }
            None => false,
        }
    }

    /// The most recent injected call still outstanding.
    pub fn last_injection(&self) -> Option<&Injection> {
        self.injected
            .checked_sub(1)
            .and_then(|i| self.injections.get(i))
    }

    pub fn pop_injection(&mut self) -> Option<Injection> {
        let last = self.last_injection().copied()?;
        self.injected -= 1;
        Some(last)
    }
}

/// What kind of task to create.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskKind {
    /// A secondary thread of the creator's process. Shares the creator's
    /// regions and process ID.
    Thread,
    /// A new process, with its own code and data.
    Process { pid: u32, code: Span, data: Span },
}

/// Everything needed to create a task.
#[derive(Copy, Clone, Debug)]
pub struct TaskSpec {
    pub entry: u32,
    pub cleanup: u32,
    pub arg: u32,
    pub stack_top: usize,
    pub stack_size: usize,
    pub priority: Priority,
    pub fifo: bool,
    pub kind: TaskKind,
    pub reent: usize,
    pub global_reent: usize,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CreateError {
    /// Every slot is in use.
    NoSlot,
    /// The stack is too small to hold a starting context, or wraps.
    BadStack,
    /// One of a new process's regions can't be encoded.
    Region(RegionError),
}

impl From<RegionError> for CreateError {
    fn from(e: RegionError) -> Self {
        Self::Region(e)
    }
}

/// Computes a process's code and data regions.
fn process_regions(code: Span, data: Span) -> Result<TaskRegions, RegionError> {
    Ok(TaskRegions {
        code: compute_region(
            code.base,
            code.size,
            AccessPolicy::ReadOnly,
            MemoryClass::Flash,
            true,
        )?,
        data: compute_region(
            data.base,
            data.size,
            AccessPolicy::FullAccess,
            MemoryClass::Sram,
            false,
        )?,
        stack_guard: RegionDesc::DISABLED,
    })
}

/// Creates a task in the first free slot after the root, on behalf of the
/// task in slot `creator`, and returns the new slot.
///
/// The new task is `USED` but not `EXECUTING`; it won't run until someone
/// makes it schedulable. Its budget starts at a full `slice`.
///
/// # Safety
///
/// The `frame::SEED_BYTES` below `spec.stack_top` must be memory the new
/// task owns; its starting context is written there.
pub unsafe fn create(
    tasks: &mut [Task],
    creator: usize,
    spec: &TaskSpec,
    slice: u32,
) -> Result<usize, CreateError> {
    let slot = tasks
        .iter()
        .enumerate()
        .skip(ROOT_SLOT + 1)
        .find(|(_, t)| !t.is_used())
        .map(|(i, _)| i)
        .ok_or(CreateError::NoSlot)?;

    unsafe { install(tasks, slot, creator, spec, TaskFlags::empty(), slice) }?;
    Ok(slot)
}

/// Sets up the root task in slot 0. It starts out schedulable.
///
/// # Safety
///
/// As for `create`.
pub unsafe fn create_root(
    tasks: &mut [Task],
    spec: &TaskSpec,
    slice: u32,
) -> Result<(), CreateError> {
    if tasks.is_empty() {
        return Err(CreateError::NoSlot);
    }
    let flags = TaskFlags::IS_ROOT | TaskFlags::EXECUTING;
    unsafe { install(tasks, ROOT_SLOT, ROOT_SLOT, spec, flags, slice) }
}

unsafe fn install(
    tasks: &mut [Task],
    slot: usize,
    creator: usize,
    spec: &TaskSpec,
    extra: TaskFlags,
    slice: u32,
) -> Result<(), CreateError> {
    if spec.stack_size < frame::SEED_BYTES {
        return Err(CreateError::BadStack);
    }
    let stack_base = spec
        .stack_top
        .checked_sub(spec.stack_size)
        .ok_or(CreateError::BadStack)?;

    let mut flags = TaskFlags::USED | extra;
    flags.set(TaskFlags::IS_FIFO, spec.fifo);

    let (pid, regions) = match spec.kind {
        TaskKind::Thread => {
            flags |= TaskFlags::IS_THREAD;
            let parent = &tasks[creator];
            (parent.pid, parent.regions)
        }
        TaskKind::Process { pid, code, data } => {
            (pid, process_regions(code, data)?)
        }
    };

    let sp = unsafe {
        frame::seed(spec.stack_top, spec.entry, spec.cleanup, spec.arg)
    };

    tasks[slot] = Task {
        sp,
        flags,
        pid,
        parent: creator,
        priority: spec.priority,
        budget: slice,
        runtime: 0,
        regions,
        reent: spec.reent,
        global_reent: spec.global_reent,
        stack_base,
        stack_top: spec.stack_top,
        ..Task::EMPTY
    };
    Ok(())
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeleteError {
    /// Slot 0 can't be freed.
    Root,
    /// Nothing lives in that slot.
    Unused,
}

/// Frees `slot`. Nothing else in the table changes.
pub fn delete(tasks: &mut [Task], slot: usize) -> Result<(), DeleteError> {
    if slot == ROOT_SLOT {
        return Err(DeleteError::Root);
    }
    let task = tasks.get_mut(slot).ok_or(DeleteError::Unused)?;
    if !task.is_used() {
        return Err(DeleteError::Unused);
    }
    task.flags.remove(TaskFlags::USED | TaskFlags::EXECUTING);
    Ok(())
}

/// Replaces the stack guard of `slot` with a no-access region at
/// `base`/`size`, leaving its code and data regions alone. Returns the new
/// guard so the caller can load it if `slot` is running.
///
/// Asking for the guard that's already there changes nothing.
pub fn set_stack_guard(
    task: &mut Task,
    base: u32,
    size: u32,
) -> Result<RegionDesc, RegionError> {
    let guard = compute_region(
        base,
        size,
        AccessPolicy::NoAccess,
        MemoryClass::Sram,
        false,
    )?;
    task.regions.stack_guard = guard;
    Ok(guard)
}

/// Finds the thread zero of process `pid`, which is where signals for the
/// process are delivered.
pub fn find_thread_zero(tasks: &[Task], pid: u32) -> Option<usize> {
    tasks
        .iter()
        .position(|t| t.is_thread_zero() && t.pid == pid)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::frame::tests::Stack;
    use crate::frame::SavedContext;

    pub(crate) const SLICE: u32 = 100;

    pub(crate) fn process_spec(stack: &Stack, pid: u32) -> TaskSpec {
        TaskSpec {
            entry: 0x0800_0100,
            cleanup: 0x0800_0200,
            arg: pid,
            stack_top: stack.top(),
            stack_size: stack.top() - stack.base(),
            priority: Priority(1),
            fifo: false,
            kind: TaskKind::Process {
                pid,
                code: Span {
                    base: 0x0800_0000,
                    size: 0x1000,
                },
                data: Span {
                    base: 0x2000_0000 + pid * 0x1000,
                    size: 0x1000,
                },
            },
            reent: 0x100 * pid as usize,
            global_reent: 0x100 * pid as usize,
        }
    }

    pub(crate) fn thread_spec(stack: &Stack) -> TaskSpec {
        TaskSpec {
            kind: TaskKind::Thread,
            reent: 0xBEEF,
            ..process_spec(stack, 0)
        }
    }

    pub(crate) fn table_with_root(n: usize, root_stack: &Stack) -> Vec<Task> {
        let mut tasks = vec![Task::EMPTY; n];
        unsafe {
            create_root(&mut tasks, &process_spec(root_stack, 0), SLICE)
        }
        .unwrap();
        tasks
    }

    #[test]
    fn root_is_executing_in_slot_zero() {
        let stack = Stack::new(256);
        let tasks = table_with_root(4, &stack);
        assert!(tasks[0].is_executing());
        assert!(tasks[0].is_root());
        assert_eq!(tasks[0].budget(), SLICE);
        assert!(tasks[1..].iter().all(|t| !t.is_used()));
    }

    #[test]
    fn create_takes_first_free_slot() {
        let root_stack = Stack::new(256);
        let stacks = [Stack::new(256), Stack::new(256), Stack::new(256)];
        let mut tasks = table_with_root(4, &root_stack);

        let a = unsafe {
            create(&mut tasks, 0, &process_spec(&stacks[0], 1), SLICE)
        };
        let b = unsafe {
            create(&mut tasks, 0, &process_spec(&stacks[1], 2), SLICE)
        };
        assert_eq!(a, Ok(1));
        assert_eq!(b, Ok(2));

        delete(&mut tasks, 1).unwrap();
        let c = unsafe {
            create(&mut tasks, 0, &process_spec(&stacks[2], 3), SLICE)
        };
        assert_eq!(c, Ok(1));
        assert_eq!(tasks[1].pid(), 3);
    }

    #[test]
    fn created_task_is_used_but_not_executing() {
        let root_stack = Stack::new(256);
        let stack = Stack::new(256);
        let mut tasks = table_with_root(2, &root_stack);
        let slot = unsafe {
            create(&mut tasks, 0, &process_spec(&stack, 7), SLICE)
        }
        .unwrap();

        let t = &tasks[slot];
        assert!(t.is_used());
        assert!(!t.is_executing());
        assert_eq!(t.budget(), SLICE);
        assert_eq!(t.runtime(), 0);
        assert_eq!(t.parent(), 0);
        assert_eq!(t.stack_base(), stack.base());

        let ctx = unsafe { SavedContext::at(t.saved_sp()) };
        let hw = unsafe { ctx.hw() };
        assert_eq!(hw.pc, 0x0800_0101);
        assert_eq!(hw.lr, 0x0800_0201);
        assert_eq!(hw.r0, 7);
    }

    #[test]
    fn full_table_returns_no_slot_and_leaves_root_alone() {
        let root_stack = Stack::new(256);
        let stacks: Vec<_> = (0..3).map(|_| Stack::new(256)).collect();
        let mut tasks = table_with_root(3, &root_stack);
        for (i, s) in stacks.iter().take(2).enumerate() {
            unsafe {
                create(&mut tasks, 0, &process_spec(s, i as u32 + 1), SLICE)
            }
            .unwrap();
        }
        let root_before = tasks[0].clone();

        let r = unsafe {
            create(&mut tasks, 0, &process_spec(&stacks[2], 9), SLICE)
        };
        assert_eq!(r, Err(CreateError::NoSlot));
        assert_eq!(tasks[0].saved_sp(), root_before.saved_sp());
        assert_eq!(tasks[0].flags(), root_before.flags());
        assert_eq!(tasks[0].regions(), root_before.regions());
    }

    #[test]
    fn process_gets_computed_regions() {
        let root_stack = Stack::new(256);
        let stack = Stack::new(256);
        let mut tasks = table_with_root(2, &root_stack);
        let slot = unsafe {
            create(&mut tasks, 0, &process_spec(&stack, 1), SLICE)
        }
        .unwrap();
        let regions = tasks[slot].regions();
        assert_eq!(regions.code.base(), 0x0800_0000);
        assert!(regions.code.executable());
        assert_eq!(regions.code.access(), Some(AccessPolicy::ReadOnly));
        assert_eq!(regions.data.base(), 0x2000_1000);
        assert!(!regions.data.executable());
        assert_eq!(regions.data.access(), Some(AccessPolicy::FullAccess));
        assert_eq!(regions.stack_guard, RegionDesc::DISABLED);
    }

    #[test]
    fn thread_copies_parent_regions() {
        let root_stack = Stack::new(256);
        let stacks = [Stack::new(256), Stack::new(256)];
        let mut tasks = table_with_root(4, &root_stack);
        let parent = unsafe {
            create(&mut tasks, 0, &process_spec(&stacks[0], 5), SLICE)
        }
        .unwrap();
        set_stack_guard(&mut tasks[parent], 0x2000_5000, 64).unwrap();

        let thread = unsafe {
            create(&mut tasks, parent, &thread_spec(&stacks[1]), SLICE)
        }
        .unwrap();
        let t = &tasks[thread];
        assert!(t.flags().contains(TaskFlags::IS_THREAD));
        assert_eq!(t.pid(), 5);
        assert_eq!(t.parent(), parent);
        assert_eq!(t.regions(), tasks[parent].regions());
    }

    #[test]
    fn misaligned_process_is_refused_without_taking_a_slot() {
        let root_stack = Stack::new(256);
        let stack = Stack::new(256);
        let mut tasks = table_with_root(2, &root_stack);
        let spec = TaskSpec {
            kind: TaskKind::Process {
                pid: 1,
                code: Span {
                    base: 0x0800_0100,
                    size: 0x1000,
                },
                data: Span {
                    base: 0x2000_0000,
                    size: 0x1000,
                },
            },
            ..process_spec(&stack, 1)
        };
        let r = unsafe { create(&mut tasks, 0, &spec, SLICE) };
        assert_eq!(r, Err(CreateError::Region(RegionError::Misaligned)));
        assert!(!tasks[1].is_used());
    }

    #[test]
    fn tiny_stack_is_refused() {
        let root_stack = Stack::new(256);
        let stack = Stack::new(256);
        let mut tasks = table_with_root(2, &root_stack);
        let spec = TaskSpec {
            stack_size: frame::SEED_BYTES - 1,
            ..process_spec(&stack, 1)
        };
        let r = unsafe { create(&mut tasks, 0, &spec, SLICE) };
        assert_eq!(r, Err(CreateError::BadStack));
    }

    #[test]
    fn delete_clears_only_the_slot() {
        let root_stack = Stack::new(256);
        let stacks = [Stack::new(256), Stack::new(256)];
        let mut tasks = table_with_root(3, &root_stack);
        for (i, s) in stacks.iter().enumerate() {
            unsafe {
                create(&mut tasks, 0, &process_spec(s, i as u32 + 1), SLICE)
            }
            .unwrap();
            tasks[i + 1].set_executing(true);
        }

        delete(&mut tasks, 1).unwrap();
        assert!(!tasks[1].is_used());
        assert!(!tasks[1].flags().contains(TaskFlags::EXECUTING));
        assert!(tasks[2].is_executing());
        assert!(tasks[0].is_executing());

        assert_eq!(delete(&mut tasks, 1), Err(DeleteError::Unused));
        assert_eq!(delete(&mut tasks, 0), Err(DeleteError::Root));
        assert_eq!(delete(&mut tasks, 99), Err(DeleteError::Unused));
    }

    #[test]
    fn stack_guard_update_is_idempotent() {
        let root_stack = Stack::new(256);
        let stack = Stack::new(256);
        let mut tasks = table_with_root(2, &root_stack);
        let slot = unsafe {
            create(&mut tasks, 0, &process_spec(&stack, 1), SLICE)
        }
        .unwrap();
        let before = *tasks[slot].regions();

        let g1 = set_stack_guard(&mut tasks[slot], 0x2000_1000, 128).unwrap();
        let once = *tasks[slot].regions();
        let g2 = set_stack_guard(&mut tasks[slot], 0x2000_1000, 128).unwrap();
        let twice = *tasks[slot].regions();

        assert_eq!(g1, g2);
        assert_eq!(once, twice);
        assert_eq!(once.code, before.code);
        assert_eq!(once.data, before.data);
        assert_eq!(once.stack_guard.access(), Some(AccessPolicy::NoAccess));
    }

    #[test]
    fn bad_stack_guard_changes_nothing() {
        let root_stack = Stack::new(256);
        let stack = Stack::new(256);
        let mut tasks = table_with_root(2, &root_stack);
        let slot = unsafe {
            create(&mut tasks, 0, &process_spec(&stack, 1), SLICE)
        }
        .unwrap();
        let before = *tasks[slot].regions();
        assert_eq!(
            set_stack_guard(&mut tasks[slot], 0x2000_1010, 32),
            Err(RegionError::Misaligned)
        );
        assert_eq!(*tasks[slot].regions(), before);
    }

    #[test]
    fn thread_zero_lookup() {
        let root_stack = Stack::new(256);
        let stacks = [Stack::new(256), Stack::new(256)];
        let mut tasks = table_with_root(4, &root_stack);
        let main = unsafe {
            create(&mut tasks, 0, &process_spec(&stacks[0], 4), SLICE)
        }
        .unwrap();
        let helper = unsafe {
            create(&mut tasks, main, &thread_spec(&stacks[1]), SLICE)
        }
        .unwrap();

        assert!(tasks[main].is_thread_zero());
        assert!(!tasks[helper].is_thread_zero());
        assert_eq!(find_thread_zero(&tasks, 4), Some(main));
        assert_eq!(find_thread_zero(&tasks, 77), None);

        delete(&mut tasks, main).unwrap();
        assert_eq!(find_thread_zero(&tasks, 4), None);
    }

    /// A thread in an earlier slot than its process, with a runtime block
    /// that looks like the process's, still isn't thread zero.
    #[test]
    fn thread_zero_lookup_skips_lookalike_threads() {
        let root_stack = Stack::new(256);
        let stacks = [Stack::new(256), Stack::new(256), Stack::new(256)];
        let mut tasks = table_with_root(3, &root_stack);
        for (i, s) in stacks.iter().take(2).enumerate() {
            unsafe {
                create(&mut tasks, 0, &process_spec(s, i as u32 + 1), SLICE)
            }
            .unwrap();
        }
        delete(&mut tasks, 1).unwrap();

        let lookalike = TaskSpec {
            reent: 0x200,
            global_reent: 0x200,
            ..thread_spec(&stacks[2])
        };
        let slot =
            unsafe { create(&mut tasks, 2, &lookalike, SLICE) }.unwrap();
        assert_eq!(slot, 1);
        assert_eq!(tasks[1].pid(), 2);
        assert!(!tasks[1].is_thread_zero());
        assert_eq!(find_thread_zero(&tasks, 2), Some(2));
    }

    #[test]
    fn guard_inside_the_stack_raises_the_save_floor() {
        let mut task = Task {
            stack_base: 0x2000_0000,
            stack_top: 0x2000_0400,
            ..Task::EMPTY
        };
        assert_eq!(task.save_floor(), 0x2000_0000);

        set_stack_guard(&mut task, 0x2000_0000, 64).unwrap();
        assert_eq!(task.save_floor(), 0x2000_0040);

        // A guard somewhere else entirely doesn't matter.
        set_stack_guard(&mut task, 0x2001_0000, 64).unwrap();
        assert_eq!(task.save_floor(), 0x2000_0000);
    }

    #[test]
    fn injections_are_stacked_and_dropped_on_fault() {
        let mut task = Task::EMPTY;
        assert!(task.last_injection().is_none());
        for i in 0..MAX_INJECTIONS {
            let injection = Injection {
                link: 0x100 * (i + 1),
                interrupted: 0x100 * i + 0x80,
            };
            assert!(task.push_injection(injection));
        }
        let extra = Injection {
            link: 0x1,
            interrupted: 0x2,
        };
        assert!(!task.push_injection(extra));
        assert_eq!(
            task.pop_injection().map(|i| i.link),
            Some(0x100 * MAX_INJECTIONS)
        );
        assert_eq!(
            task.last_injection().map(|i| i.link),
            Some(0x100 * (MAX_INJECTIONS - 1))
        );

        task.force_fault(FaultInfo::IllegalInstruction);
        assert!(task.pop_injection().is_none());
    }

    #[test]
    fn fault_stops_the_task() {
        let root_stack = Stack::new(256);
        let stack = Stack::new(256);
        let mut tasks = table_with_root(2, &root_stack);
        let slot = unsafe {
            create(&mut tasks, 0, &process_spec(&stack, 1), SLICE)
        }
        .unwrap();
        tasks[slot].set_executing(true);
        tasks[slot].force_fault(FaultInfo::DivideByZero);
        assert!(!tasks[slot].is_executing());
        assert!(tasks[slot].is_used());
        assert_eq!(tasks[slot].fault(), Some(FaultInfo::DivideByZero));
    }
}
