// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Choosing what runs next.
//!
//! Tasks are chosen by priority, and round-robin within a priority, using a
//! per-task budget of slice-timer counts. A task whose budget has dropped to
//! `min_budget` or below sits out until every task has spent its slice, at
//! which point every executing task gets a fresh slice at once. FIFO tasks
//! ignore their budget and run until they give up the CPU.
//!
//! The root task is the fallback: it runs when nothing else can, and it
//! spends a budget like everyone else.

use abi::ROOT_SLOT;

use crate::mpu::{self, ProtectionUnit};
use crate::profiling;
use crate::task::Task;
use crate::time::Timestamp;

/// Whether an operation wants the scheduler to run before returning to a
/// task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NextTask {
    /// Keep running the current task.
    Same,
    /// Pick again; some other task may be more deserving now.
    Other,
}

impl NextTask {
    pub fn combine(self, other: Self) -> Self {
        match (self, other) {
            (Self::Same, Self::Same) => Self::Same,
            _ => Self::Other,
        }
    }
}

/// How the slice timer should run for the task being dispatched.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TickMode {
    /// Interrupt after this many counts.
    Armed(u32),
    /// Keep counting for accounting, but never interrupt.
    Disabled,
}

/// Counts that have passed on a down-counter reloaded with `load` counts,
/// which has wrapped `wraps` times since it was armed and now reads
/// `current`. A freshly armed counter reads zero until its first reload.
///
/// Saturates at `u32::MAX`; a task would have to run unpreempted for that
/// many counts to notice.
pub fn counts_elapsed(load: u32, wraps: u32, current: u32) -> u32 {
    let partial = match current {
        0 => 0,
        n => load.saturating_sub(1).saturating_sub(n),
    };
    wraps.saturating_mul(load).saturating_add(partial)
}

/// The down-counting timer that bounds each slice.
pub trait SliceTimer {
    /// Returns the counts since the timer was last armed and starts counting
    /// from zero again.
    fn take_elapsed(&mut self) -> u32;

    fn arm(&mut self, mode: TickMode);
}

pub struct Scheduler {
    current: usize,
    slice: u32,
    min_budget: u32,
    reloads: u64,
    uptime: Timestamp,
}

impl Scheduler {
    /// Starts out with the root task current.
    pub fn new(slice: u32, min_budget: u32) -> Self {
        Self {
            current: ROOT_SLOT,
            slice,
            min_budget,
            reloads: 0,
            uptime: Timestamp::ZERO,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn slice(&self) -> u32 {
        self.slice
    }

    /// Number of times every task's slice has been refilled.
    pub fn reloads(&self) -> u64 {
        self.reloads
    }

    /// Total counts charged to any task since boot.
    pub fn uptime(&self) -> Timestamp {
        self.uptime
    }

    /// Charges the current task for `elapsed` counts of CPU.
    pub fn charge(&mut self, tasks: &mut [Task], elapsed: u32) {
        tasks[self.current].charge(elapsed);
        self.uptime = self.uptime.advanced(elapsed);
    }

    fn runnable(&self, t: &Task) -> bool {
        !t.is_root()
            && t.is_executing()
            && (t.is_fifo() || t.budget() > self.min_budget)
    }

    /// Picks the next task, makes it current, and returns its index.
    ///
    /// Always succeeds, because the root task can't be stopped.
    pub fn select(&mut self, tasks: &mut [Task]) -> usize {
        let next = match self.pick(tasks) {
            Some(i) => i,
            None if tasks[ROOT_SLOT].budget() > self.min_budget => ROOT_SLOT,
            None => {
                self.reload(tasks);
                self.pick(tasks).unwrap_or(ROOT_SLOT)
            }
        };
        self.current = next;
        next
    }

    fn pick(&self, tasks: &[Task]) -> Option<usize> {
        priority_scan(self.current, tasks, |t| self.runnable(t)).map(|(i, _)| i)
    }

    /// Gives every executing task a fresh slice.
    fn reload(&mut self, tasks: &mut [Task]) {
        for t in tasks.iter_mut().filter(|t| t.is_executing()) {
            t.reload_budget(self.slice);
        }
        self.reloads += 1;
        profiling::event_slice_reload();
    }
}

/// Loads `task`'s regions and says how to run the slice timer for it.
pub fn dispatch(mpu: &mut impl ProtectionUnit, task: &Task) -> TickMode {
    mpu::load_task(mpu, task.regions());
    if task.is_fifo() {
        TickMode::Disabled
    } else {
        TickMode::Armed(task.budget())
    }
}

/// Scans the task table to find a prioritized candidate.
///
/// Scans `tasks` for the next task, after `previous`, that satisfies `pred`. If
/// more than one task satisfies `pred`, returns the most important one. If
/// multiple tasks with the same priority satisfy `pred`, prefers the first one
/// in order after `previous`, mod `tasks.len()`. Finally, if no tasks satisfy
/// `pred`, returns `None`
///
/// On success, the return value is the task's index in the task table, and a
/// direct reference to the task.
pub fn priority_scan(
    previous: usize,
    tasks: &[Task],
    pred: impl Fn(&Task) -> bool,
) -> Option<(usize, &Task)> {
    let mut pos = previous;
    let mut choice: Option<(usize, &Task)> = None;
    for _step_no in 0..tasks.len() {
        pos = pos.wrapping_add(1);
        if pos >= tasks.len() {
            pos = 0;
        }
        let t = &tasks[pos];
        if !pred(t) {
            continue;
        }

        if let Some((_, best_task)) = choice {
            if !t.priority().is_more_important_than(best_task.priority()) {
                continue;
            }
        }

        choice = Some((pos, t));
    }

    choice
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::FakeMachine;
    use crate::frame::tests::Stack;
    use crate::task::tests::{process_spec, table_with_root, SLICE};
    use crate::task::{self, TaskSpec};
    use abi::Priority;
    use proptest::prelude::*;

    const MIN: u32 = 10;

    /// A root plus `n` executing processes, all at priority 1.
    fn table(n: usize) -> (Vec<Task>, Vec<Stack>) {
        let stacks: Vec<_> = (0..=n).map(|_| Stack::new(256)).collect();
        let mut tasks = table_with_root(n + 1, &stacks[0]);
        for (i, s) in stacks.iter().enumerate().skip(1) {
            let slot = unsafe {
                task::create(&mut tasks, 0, &process_spec(s, i as u32), SLICE)
            }
            .unwrap();
            tasks[slot].set_executing(true);
        }
        (tasks, stacks)
    }

    #[test]
    fn long_runs_are_charged_every_wrap() {
        const LOAD: u32 = 1 << 24;
        assert_eq!(counts_elapsed(LOAD, 0, 0), 0);
        assert_eq!(counts_elapsed(LOAD, 0, LOAD - 1 - 500), 500);
        // Three whole periods and then some.
        assert_eq!(
            counts_elapsed(LOAD, 3, LOAD - 1 - 500),
            3 * LOAD + 500
        );
        // Caught right on the wrap.
        assert_eq!(counts_elapsed(LOAD, 2, 0), 2 * LOAD);
        assert_eq!(counts_elapsed(LOAD, 1000, 1), u32::MAX);
    }

    #[test]
    fn equal_priorities_go_round_robin() {
        let (mut tasks, _stacks) = table(3);
        let mut sched = Scheduler::new(SLICE, MIN);
        assert_eq!(sched.select(&mut tasks), 1);
        assert_eq!(sched.select(&mut tasks), 2);
        assert_eq!(sched.select(&mut tasks), 3);
        assert_eq!(sched.select(&mut tasks), 1);
    }

    #[test]
    fn more_important_task_wins() {
        let (mut tasks, _stacks) = table(3);
        tasks[3].set_priority(Priority(0));
        let mut sched = Scheduler::new(SLICE, MIN);
        assert_eq!(sched.select(&mut tasks), 3);
        assert_eq!(sched.select(&mut tasks), 3);
    }

    #[test]
    fn stopped_task_is_never_chosen() {
        let (mut tasks, _stacks) = table(2);
        tasks[1].set_executing(false);
        let mut sched = Scheduler::new(SLICE, MIN);
        assert_eq!(sched.select(&mut tasks), 2);
        assert_eq!(sched.select(&mut tasks), 2);
    }

    #[test]
    fn exhausted_task_sits_out() {
        let (mut tasks, _stacks) = table(2);
        let mut sched = Scheduler::new(SLICE, MIN);
        assert_eq!(sched.select(&mut tasks), 1);
        sched.charge(&mut tasks, SLICE - MIN + 1);
        assert_eq!(sched.select(&mut tasks), 2);
        assert_eq!(sched.select(&mut tasks), 2);
        assert_eq!(sched.reloads(), 0);
    }

    #[test]
    fn root_runs_while_it_has_budget() {
        let (mut tasks, _stacks) = table(2);
        tasks[1].reload_budget(0);
        tasks[2].reload_budget(0);
        let mut sched = Scheduler::new(SLICE, MIN);
        assert_eq!(sched.select(&mut tasks), ROOT_SLOT);
        assert_eq!(sched.reloads(), 0);
    }

    #[test]
    fn fair_reload_refills_everyone_at_once() {
        let (mut tasks, _stacks) = table(4);
        for t in tasks.iter_mut() {
            t.reload_budget(MIN - 1);
        }
        tasks[4].set_executing(false);
        tasks[4].reload_budget(3);

        let mut sched = Scheduler::new(SLICE, MIN);
        let chosen = sched.select(&mut tasks);
        assert_eq!(chosen, 1);
        assert_eq!(sched.reloads(), 1);
        for t in &tasks[..4] {
            assert_eq!(t.budget(), SLICE);
        }
        // Stopped tasks keep what they had.
        assert_eq!(tasks[4].budget(), 3);
    }

    #[test]
    fn budget_at_threshold_counts_as_spent() {
        let (mut tasks, _stacks) = table(2);
        tasks[0].reload_budget(MIN - 1);
        tasks[1].reload_budget(MIN);
        tasks[2].reload_budget(MIN);

        let mut sched = Scheduler::new(SLICE, MIN);
        assert_eq!(sched.select(&mut tasks), 1);
        assert_eq!(sched.reloads(), 1);
        assert_eq!(tasks[1].budget(), SLICE);
        assert_eq!(tasks[2].budget(), SLICE);

        // Root at exactly the threshold doesn't get to run either.
        tasks[1].reload_budget(0);
        tasks[2].reload_budget(0);
        tasks[0].reload_budget(MIN);
        assert_eq!(sched.select(&mut tasks), 2);
        assert_eq!(sched.reloads(), 2);
    }

    #[test]
    fn fifo_task_ignores_budget() {
        let stacks: Vec<_> = (0..3).map(|_| Stack::new(256)).collect();
        let mut tasks = table_with_root(3, &stacks[0]);
        let fifo = TaskSpec {
            fifo: true,
            ..process_spec(&stacks[1], 1)
        };
        let f = unsafe { task::create(&mut tasks, 0, &fifo, SLICE) }.unwrap();
        let r = unsafe {
            task::create(&mut tasks, 0, &process_spec(&stacks[2], 2), SLICE)
        }
        .unwrap();
        tasks[f].set_executing(true);
        tasks[r].set_executing(true);
        tasks[f].reload_budget(0);
        tasks[r].reload_budget(0);

        let mut sched = Scheduler::new(SLICE, MIN);
        assert_eq!(sched.select(&mut tasks), f);
        sched.charge(&mut tasks, 500);
        assert_eq!(tasks[f].runtime(), 500);
        assert_eq!(tasks[f].budget(), 0);
        assert_eq!(sched.select(&mut tasks), f);
    }

    #[test]
    fn dispatch_loads_regions_and_arms_timer() {
        let (mut tasks, _stacks) = table(2);
        task::set_stack_guard(&mut tasks[2], 0x2000_2000, 32).unwrap();
        tasks[2].reload_budget(42);
        let mut hw = FakeMachine::new(8);

        let mode = dispatch(&mut hw, &tasks[2]);
        assert_eq!(mode, TickMode::Armed(42));
        assert_eq!(hw.region(mpu::TASK_CODE_SLOT), tasks[2].regions().code);
        assert_eq!(hw.region(mpu::TASK_DATA_SLOT), tasks[2].regions().data);
        assert_eq!(
            hw.region(mpu::STACK_GUARD_SLOT),
            tasks[2].regions().stack_guard
        );
    }

    #[test]
    fn uptime_accumulates() {
        let (mut tasks, _stacks) = table(1);
        let mut sched = Scheduler::new(SLICE, MIN);
        sched.charge(&mut tasks, 30);
        sched.select(&mut tasks);
        sched.charge(&mut tasks, 12);
        assert_eq!(u64::from(sched.uptime()), 42);
        assert_eq!(tasks[0].runtime(), 30);
        assert_eq!(tasks[1].runtime(), 12);
    }

    #[derive(Clone, Debug)]
    struct SlotShape {
        executing: bool,
        fifo: bool,
        priority: u8,
        budget: u32,
    }

    fn slot_shape() -> impl Strategy<Value = SlotShape> {
        (any::<bool>(), any::<bool>(), 0u8..4, 0u32..=SLICE).prop_map(
            |(executing, fifo, priority, budget)| SlotShape {
                executing,
                fifo,
                priority,
                budget,
            },
        )
    }

    proptest! {
        #[test]
        fn only_executing_tasks_are_chosen(
            shapes in proptest::collection::vec(slot_shape(), 1..8),
            root_budget in 0u32..=SLICE,
            previous in 0usize..8,
            rounds in 1usize..6
        ) {
            let stacks: Vec<_> =
                (0..=shapes.len()).map(|_| Stack::new(256)).collect();
            let mut tasks = table_with_root(shapes.len() + 1, &stacks[0]);
            tasks[0].reload_budget(root_budget);
            for (i, shape) in shapes.iter().enumerate() {
                let spec = TaskSpec {
                    fifo: shape.fifo,
                    priority: Priority(shape.priority),
                    ..process_spec(&stacks[i + 1], i as u32 + 1)
                };
                let slot = unsafe {
                    task::create(&mut tasks, 0, &spec, SLICE)
                }.unwrap();
                tasks[slot].set_executing(shape.executing);
                tasks[slot].reload_budget(shape.budget);
            }

            let mut sched = Scheduler::new(SLICE, MIN);
            sched.current = previous % tasks.len();
            for _ in 0..rounds {
                let chosen = sched.select(&mut tasks);
                prop_assert!(tasks[chosen].is_executing());
                prop_assert_eq!(sched.current(), chosen);
                if !tasks[chosen].is_root() {
                    let best = tasks
                        .iter()
                        .filter(|t| sched.runnable(t))
                        .all(|t| !t.priority()
                            .is_more_important_than(tasks[chosen].priority()));
                    prop_assert!(best);
                }
                sched.charge(&mut tasks, SLICE / 2);
            }
        }
    }
}
