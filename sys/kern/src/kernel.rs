// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel proper: the task table, the scheduler and the machine, tied
//! together.
//!
//! Every way into the kernel (the gate, the deferred switch, the faults)
//! arrives here with the stack pointer of the task it interrupted, and leaves
//! with the stack pointer of the task to resume.

use abi::{FaultInfo, ROOT_SLOT};
use kerncore::{compute_region, AccessPolicy, MemoryClass, RegionDesc};

use crate::err::{ConfigError, UserError};
use crate::fail;
use crate::frame::SavedContext;
use crate::gate::{InvokeFn, Platform};
use crate::mpu::{self, ProtectionUnit};
use crate::profiling;
use crate::sched::{self, NextTask, Scheduler, SliceTimer};
use crate::task::{self, Span, Task, TaskSpec};
use crate::time::Timestamp;

/// Everything the kernel needs from the hardware.
pub trait Machine: ProtectionUnit + SliceTimer + Platform {}

impl<T: ProtectionUnit + SliceTimer + Platform> Machine for T {}

/// Fixed parameters of a kernel instance.
#[derive(Copy, Clone, Debug)]
pub struct KernelParams {
    /// Counts in a full slice.
    pub slice: u32,
    /// A task with this many counts left, or fewer, sits out until the reload.
    pub min_budget: u32,
    pub kernel_ram: Span,
    pub kernel_code: Span,
}

pub struct Kernel<'a, M> {
    tasks: &'a mut [Task],
    sched: Scheduler,
    pub(crate) hw: M,
    pub(crate) invoke: &'a [InvokeFn],
}

impl<'a, M: Machine> Kernel<'a, M> {
    /// Sets up protection for the kernel's own memory. No task exists yet.
    pub fn new(
        tasks: &'a mut [Task],
        mut hw: M,
        params: &KernelParams,
        invoke: &'a [InvokeFn],
    ) -> Result<Self, ConfigError> {
        let ram = compute_region(
            params.kernel_ram.base,
            params.kernel_ram.size,
            AccessPolicy::PrivilegedWriteUserRead,
            MemoryClass::Sram,
            false,
        )
        .map_err(ConfigError::KernelRam)?;
        let code = compute_region(
            params.kernel_code.base,
            params.kernel_code.size,
            AccessPolicy::ReadOnly,
            MemoryClass::Flash,
            true,
        )
        .map_err(ConfigError::KernelCode)?;
        mpu::init(&mut hw, &ram, &code)?;

        Ok(Self {
            tasks,
            sched: Scheduler::new(params.slice, params.min_budget),
            hw,
            invoke,
        })
    }

    /// Creates the root task and makes it current. Returns the stack pointer
    /// to start it with.
    ///
    /// # Safety
    ///
    /// As for `task::create`.
    pub unsafe fn boot_root(
        &mut self,
        root: &TaskSpec,
    ) -> Result<usize, ConfigError> {
        let slice = self.sched.slice();
        unsafe { task::create_root(&mut *self.tasks, root, slice) }
            .map_err(ConfigError::RootTask)?;
        let mode = sched::dispatch(&mut self.hw, &self.tasks[ROOT_SLOT]);
        self.hw.arm(mode);
        self.publish(ROOT_SLOT);
        Ok(self.tasks[ROOT_SLOT].saved_sp())
    }

    pub fn tasks(&self) -> &[Task] {
        &*self.tasks
    }

    pub(crate) fn tasks_mut(&mut self) -> &mut [Task] {
        &mut *self.tasks
    }

    pub fn current(&self) -> usize {
        self.sched.current()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    pub fn uptime(&self) -> Timestamp {
        self.sched.uptime()
    }

    pub fn machine(&self) -> &M {
        &self.hw
    }

    pub fn machine_mut(&mut self) -> &mut M {
        &mut self.hw
    }

    /// Runtime block of the running task.
    pub fn current_reentrancy(&self) -> usize {
        self.tasks[self.current()].reentrancy()
    }

    /// Saves the interrupted task's stack pointer and picks who runs next.
    pub fn switch(&mut self, saved_sp: usize) -> usize {
        let current = self.current();
        self.tasks[current].set_saved_sp(saved_sp);
        let sp = self.reschedule();
        self.vetted(sp)
    }

    /// Charges the current task and dispatches whichever task the scheduler
    /// picks, which may be the same one. The current task's stack pointer
    /// must already be saved.
    pub(crate) fn reschedule(&mut self) -> usize {
        let previous = self.current();
        let elapsed = self.hw.take_elapsed();
        self.sched.charge(&mut *self.tasks, elapsed);

        let next = self.sched.select(&mut *self.tasks);
        let mode = sched::dispatch(&mut self.hw, &self.tasks[next]);
        self.hw.arm(mode);
        self.publish(next);
        if next != previous {
            profiling::event_context_switch(next);
        }
        self.tasks[next].saved_sp()
    }

    /// Tells the machine about task `idx`, which is about to run.
    fn publish(&mut self, idx: usize) {
        let task = &self.tasks[idx];
        self.hw.publish_reentrancy(task.reentrancy());
        self.hw.publish_stack(task.save_floor(), task.stack_top());
    }

    /// Finishes up an operation on behalf of the current task: switches
    /// if asked to, and returns the stack pointer to resume.
    pub(crate) fn resume(&mut self, next: NextTask) -> usize {
        let sp = match next {
            NextTask::Same => self.tasks[self.current()].saved_sp(),
            NextTask::Other => self.reschedule(),
        };
        self.vetted(sp)
    }

    /// Checks that the context at `sp`, which belongs to the current task,
    /// returns to Thread mode on the process stack, and returns `sp` if so.
    ///
    /// Saved contexts sit in memory other tasks of the same process can
    /// write. A task whose context has been scribbled on is faulted, and
    /// someone else picked, until a good one turns up; the root task going
    /// bad takes the system down.
    fn vetted(&mut self, mut sp: usize) -> usize {
        loop {
            // Safety: every saved stack pointer names a context, and `sp`
            // is the current task's.
            let sw = unsafe { SavedContext::at(sp).sw() };
            if sw.returns_to_task() {
                return sp;
            }
            let fault = FaultInfo::CorruptContext {
                exc_return: sw.exc_return,
            };
            self.record_fault(self.current(), fault);
            sp = self.reschedule();
        }
    }

    /// Stops task `idx` with `fault`. A fault in the root task brings the
    /// whole system down.
    pub fn record_fault(&mut self, idx: usize, fault: FaultInfo) -> NextTask {
        if idx == ROOT_SLOT {
            fail::die(RootFault(fault));
        }
        self.tasks[idx].force_fault(fault);
        profiling::event_task_fault(idx);
        if idx == self.current() {
            NextTask::Other
        } else {
            NextTask::Same
        }
    }

    /// Handles a processor fault taken by the current task, and returns the
    /// stack pointer of the task to run instead.
    ///
    /// Nothing is saved from the faulting task; its stack may be what caused
    /// the fault. Before it is started again, its stack pointer has to be
    /// set to something sensible.
    pub fn fault_current(&mut self, fault: FaultInfo) -> usize {
        let next = self.record_fault(self.current(), fault);
        self.resume(next)
    }

    /// Applies the result of a failed operation to the current task.
    pub(crate) fn apply_error(
        &mut self,
        saved_sp: usize,
        err: UserError,
    ) -> NextTask {
        match err {
            UserError::Recoverable(code, next) => {
                // Safety: `saved_sp` is the caller's trap context.
                unsafe {
                    SavedContext::at(saved_sp).set_return(code as u32);
                }
                next
            }
            UserError::Unrecoverable(fault) => {
                self.record_fault(self.current(), fault)
            }
        }
    }

    /// Loads a new stack guard for the running task, which may move the
    /// floor of its stack.
    pub(crate) fn reload_stack_guard(&mut self, guard: &RegionDesc) {
        mpu::load_stack_guard(&mut self.hw, guard);
        self.publish(self.current());
    }
}

struct RootFault(FaultInfo);

impl core::fmt::Display for RootFault {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "root task fault: {:?}", self.0)
    }
}
