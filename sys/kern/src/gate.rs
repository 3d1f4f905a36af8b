// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The privileged call gate.
//!
//! A task asks for an operation by trapping with the operation number in
//! `r0` and up to three arguments in `r1`-`r3`. Every operation produces a
//! single word, which the task finds in `r0` when it resumes; failures are
//! reported as one of the `GateError` codes at the top of the word. Misuse
//! that can't sensibly be reported back (a bad argument pointer, a restore
//! with nothing to restore) faults the caller instead.
//!
//! Who may do what:
//!
//! - Only the root task may reset, mask and unmask interrupts, move another
//!   task's stack pointer, change priorities, invoke privileged functions, or
//!   create processes.
//! - Any task may create threads within its own process.
//! - Operations naming a task are allowed from the root task, or from tasks
//!   in the same process as the target.
//! - Nobody may stop or delete the root task.

use core::mem::size_of;

use abi::{CreateArgs, GateError, GateOp, Priority, TaskFlags, UsageError};
use zerocopy::FromBytes;

use crate::err::UserError;
use crate::frame::{self, HwFrame, InjectedCall, SavedContext, SwFrame};
use crate::kernel::{Kernel, Machine};
use crate::profiling;
use crate::sched::NextTask;
use crate::task::{self, DeleteError, Span, TaskKind, TaskSpec};

/// A privileged function the root task may run with `GateOp::Invoke`.
pub type InvokeFn = fn(u32) -> u32;

/// Machine services used by gate operations.
pub trait Platform {
    /// Masks or unmasks external interrupt `irq`.
    fn set_irq_enabled(&mut self, irq: u32, on: bool) -> Result<(), GateError>;

    fn reset(&mut self) -> !;

    /// Address of the code that injected calls return into. It must issue
    /// `GateOp::Restore`.
    fn restore_trampoline(&self) -> u32;

    /// Turns `len` bytes of task address space at `addr` into something the
    /// kernel can dereference, if they exist. This does no permission
    /// checking.
    fn translate(&self, addr: u32, len: usize) -> Option<usize>;

    /// Tells the task runtime which block belongs to the running task.
    fn publish_reentrancy(&mut self, reent: usize);

    /// Tells the kernel entry sequence which part of the running task's
    /// stack it may save registers to: from `floor` up to `top`.
    fn publish_stack(&mut self, floor: usize, top: usize);
}

/// Result of a successful operation.
struct Done {
    /// Written to the caller's `r0`, unless the operation has replaced the
    /// caller's context altogether.
    value: Option<u32>,
    next: NextTask,
}

impl Done {
    fn value(value: u32) -> Self {
        Self {
            value: Some(value),
            next: NextTask::Same,
        }
    }

    fn then(self, next: NextTask) -> Self {
        Self { next, ..self }
    }
}

/// Smallest context a stack pointer may name.
const CONTEXT_BYTES: usize = size_of::<SwFrame>() + size_of::<HwFrame>();

impl<M: Machine> Kernel<'_, M> {
    /// Entry point for the gate. `saved_sp` is the stack pointer of the
    /// caller's trap context; returns the stack pointer to resume.
    pub fn gate(&mut self, saved_sp: usize) -> usize {
        // Safety: the trap sequence saved a full context at `saved_sp`.
        let ctx = unsafe { SavedContext::at(saved_sp) };
        let [op, a1, a2, a3] = unsafe { ctx.args() };
        profiling::event_gate_enter(op);

        let current = self.current();
        self.tasks_mut()[current].set_saved_sp(saved_sp);

        let next = match self.perform(saved_sp, op, [a1, a2, a3]) {
            Ok(done) => {
                if let Some(v) = done.value {
                    // Safety: the caller's context is still where it was,
                    // even if we've stacked something in front of it.
                    unsafe { ctx.set_return(v) };
                }
                done.next
            }
            Err(e) => self.apply_error(saved_sp, e),
        };

        let sp = self.resume(next);
        profiling::event_gate_exit();
        sp
    }

    fn perform(
        &mut self,
        saved_sp: usize,
        op: u32,
        args: [u32; 3],
    ) -> Result<Done, UserError> {
        let [a1, a2, a3] = args;
        match GateOp::try_from(op)? {
            GateOp::Reset => {
                self.require_root()?;
                self.hw.reset()
            }
            GateOp::IrqEnable => self.irq_control(a1, true),
            GateOp::IrqDisable => self.irq_control(a1, false),
            GateOp::ReadStackPointer => self.read_stack_pointer(a1),
            GateOp::SetStackPointer => self.set_stack_pointer(a1, a2),
            GateOp::CreateTask => self.create_task(a1),
            GateOp::Delete => self.delete(a1),
            GateOp::SetExecuting => self.set_executing(a1, a2 != 0),
            GateOp::SetPriority => self.set_priority(a1, a2),
            GateOp::SetStackGuard => self.set_stack_guard(a1, a2, a3),
            GateOp::Inject => self.inject(a1, a2, a3),
            GateOp::Restore => self.restore(saved_sp),
            GateOp::Yield => {
                let current = self.current();
                self.tasks_mut()[current].reload_budget(0);
                Ok(Done::value(0).then(NextTask::Other))
            }
            GateOp::Invoke => self.invoke(a1, a2),
        }
    }

    fn caller_is_root(&self) -> bool {
        self.tasks()[self.current()].is_root()
    }

    fn require_root(&self) -> Result<(), UserError> {
        if self.caller_is_root() {
            Ok(())
        } else {
            Err(GateError::NotPermitted.into())
        }
    }

    /// Checks that the caller may operate on task `idx`.
    fn target(&self, idx: u32) -> Result<usize, UserError> {
        let idx = idx as usize;
        let target = self
            .tasks()
            .get(idx)
            .filter(|t| t.is_used())
            .ok_or(GateError::BadTask)?;
        let caller = &self.tasks()[self.current()];
        if caller.is_root() || caller.pid() == target.pid() {
            Ok(idx)
        } else {
            Err(GateError::NotPermitted.into())
        }
    }

    /// Resolves memory the caller has asked the kernel to use on its behalf.
    fn caller_memory(
        &self,
        addr: u32,
        len: usize,
        write: bool,
    ) -> Option<usize> {
        let regions = self.tasks()[self.current()].regions().as_array();
        if !kerncore::user_can_access(&regions, addr as usize, len, write) {
            return None;
        }
        self.hw.translate(addr, len)
    }

    fn irq_control(&mut self, irq: u32, on: bool) -> Result<Done, UserError> {
        self.require_root()?;
        self.hw.set_irq_enabled(irq, on)?;
        Ok(Done::value(0))
    }

    fn read_stack_pointer(&self, idx: u32) -> Result<Done, UserError> {
        let idx = self.target(idx)?;
        // Safety: tasks that aren't running have a context at their saved
        // stack pointer, and the caller's was saved on the way in.
        let ctx = unsafe { SavedContext::at(self.tasks()[idx].saved_sp()) };
        Ok(Done::value(ctx.end() as u32))
    }

    fn set_stack_pointer(
        &mut self,
        idx: u32,
        sp: u32,
    ) -> Result<Done, UserError> {
        self.require_root()?;
        let idx = self.target(idx)?;
        if idx == self.current() {
            return Err(GateError::NotPermitted.into());
        }
        let sp = self
            .hw
            .translate(sp, CONTEXT_BYTES)
            .filter(|&sp| sp & 3 == 0 && sp >= self.tasks()[idx].stack_base())
            .ok_or(GateError::BadLayout)?;
        self.tasks_mut()[idx].replace_saved_sp(sp);
        Ok(Done::value(0))
    }

    fn create_task(&mut self, args_addr: u32) -> Result<Done, UserError> {
        let args = self
            .caller_memory(args_addr, size_of::<CreateArgs>(), false)
            .and_then(|p| {
                // Safety: `caller_memory` vouched for these bytes.
                let bytes = unsafe {
                    core::slice::from_raw_parts(
                        p as *const u8,
                        size_of::<CreateArgs>(),
                    )
                };
                CreateArgs::read_from_bytes(bytes).ok()
            })
            .ok_or(UsageError::BadArgumentPointer)?;

        let flags = TaskFlags::from_bits_truncate(args.flags)
            & TaskFlags::REQUESTABLE;
        let thread = flags.contains(TaskFlags::IS_THREAD);
        let fifo = flags.contains(TaskFlags::IS_FIFO);
        let priority = u8::try_from(args.priority)
            .map(Priority)
            .map_err(|_| GateError::BadOperation)?;
        if !self.caller_is_root() {
            // Nobody hands out more than they have themselves.
            let creator = &self.tasks()[self.current()];
            if !thread
                || priority.is_more_important_than(creator.priority())
                || (fifo && !creator.is_fifo())
            {
                return Err(GateError::NotPermitted.into());
            }
        }
        // A thread sharing its process's runtime block would pass for
        // thread zero.
        if thread && args.reent == args.global_reent {
            return Err(GateError::BadLayout.into());
        }

        let size = args.stack_size as usize;
        let base = args
            .stack_top
            .checked_sub(args.stack_size)
            .ok_or(GateError::BadLayout)?;
        let stack_base = if thread {
            self.caller_memory(base, size, true)
        } else {
            self.hw.translate(base, size)
        }
        .ok_or(GateError::BadLayout)?;

        let kind = if thread {
            TaskKind::Thread
        } else {
            TaskKind::Process {
                pid: args.pid,
                code: Span {
                    base: args.code_base,
                    size: args.code_size,
                },
                data: Span {
                    base: args.data_base,
                    size: args.data_size,
                },
            }
        };
        let spec = TaskSpec {
            entry: args.entry,
            cleanup: args.cleanup,
            arg: args.arg,
            stack_top: stack_base + size,
            stack_size: size,
            priority,
            fifo,
            kind,
            reent: args.reent as usize,
            global_reent: args.global_reent as usize,
        };

        let creator = self.current();
        let slice = self.scheduler().slice();
        // Safety: the stack was checked against the caller's regions for a
        // thread, and processes are only created by the root task.
        let slot =
            unsafe { task::create(self.tasks_mut(), creator, &spec, slice) }?;
        Ok(Done::value(slot as u32))
    }

    fn delete(&mut self, idx: u32) -> Result<Done, UserError> {
        let idx = self.target(idx)?;
        task::delete(self.tasks_mut(), idx).map_err(|e| match e {
            DeleteError::Root => GateError::NotPermitted,
            DeleteError::Unused => GateError::BadTask,
        })?;
        let next = if idx == self.current() {
            NextTask::Other
        } else {
            NextTask::Same
        };
        Ok(Done::value(0).then(next))
    }

    fn set_executing(&mut self, idx: u32, on: bool) -> Result<Done, UserError> {
        let idx = self.target(idx)?;
        let current = self.current();
        let tasks = self.tasks_mut();
        if tasks[idx].is_root() && !on {
            return Err(GateError::NotPermitted.into());
        }
        tasks[idx].set_executing(on);

        let next = if on {
            let preempts = tasks[idx]
                .priority()
                .is_more_important_than(tasks[current].priority());
            if preempts {
                NextTask::Other
            } else {
                NextTask::Same
            }
        } else if idx == current {
            NextTask::Other
        } else {
            NextTask::Same
        };
        Ok(Done::value(0).then(next))
    }

    fn set_priority(
        &mut self,
        idx: u32,
        priority: u32,
    ) -> Result<Done, UserError> {
        self.require_root()?;
        let idx = self.target(idx)?;
        let priority =
            u8::try_from(priority).map_err(|_| GateError::BadOperation)?;
        self.tasks_mut()[idx].set_priority(Priority(priority));
        Ok(Done::value(0).then(NextTask::Other))
    }

    fn set_stack_guard(
        &mut self,
        idx: u32,
        base: u32,
        size: u32,
    ) -> Result<Done, UserError> {
        let idx = self.target(idx)?;
        let guard =
            task::set_stack_guard(&mut self.tasks_mut()[idx], base, size)?;
        if idx == self.current() {
            self.reload_stack_guard(&guard);
        }
        Ok(Done::value(0))
    }

    fn inject(
        &mut self,
        idx: u32,
        function: u32,
        arg: u32,
    ) -> Result<Done, UserError> {
        let idx = self.target(idx)?;
        let call = InjectedCall {
            function,
            arg,
            restorer: self.hw.restore_trampoline(),
        };
        let task = &mut self.tasks_mut()[idx];
        // Safety: the target's context is at its saved stack pointer (for the
        // caller, we saved it on the way in), and its stack base was recorded
        // at creation.
        let (sp, pending) = unsafe {
            frame::inject(task.saved_sp(), task.stack_base(), &call)
        }
        .map_err(|_| GateError::StackOverflow)?;
        if !task.push_injection(pending) {
            return Err(GateError::StackOverflow.into());
        }
        task.set_saved_sp(sp);
        profiling::event_injection(idx);
        Ok(Done::value(0))
    }

    fn restore(&mut self, saved_sp: usize) -> Result<Done, UserError> {
        let current = self.current();
        let task = &mut self.tasks_mut()[current];
        let pending = task
            .last_injection()
            .copied()
            .ok_or(UsageError::NoInjectedFrame)?;
        // Safety: `saved_sp` is the caller's trap context.
        let sp = unsafe { frame::unwind_injection(saved_sp, &pending) }?;
        task.pop_injection();
        task.set_saved_sp(sp);
        Ok(Done {
            value: None,
            next: NextTask::Same,
        })
    }

    fn invoke(&mut self, function: u32, arg: u32) -> Result<Done, UserError> {
        self.require_root()?;
        let f = self
            .invoke
            .iter()
            .find(|f| **f as usize as u32 == function)
            .ok_or(GateError::NotAllowed)?;
        Ok(Done::value(f(arg)))
    }
}
