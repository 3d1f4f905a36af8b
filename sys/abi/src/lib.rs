// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between kernel and tasks.

#![no_std]

use serde::{Deserialize, Serialize};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Returned in place of a slot index when the task table is full.
pub const NO_SLOT: u32 = u32::MAX;

/// Index of the root task, which is never freed.
pub const ROOT_SLOT: usize = 0;

/// Indicates priority of a task.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important, so Priority 0 is the most likely to be
/// scheduled, followed by 1, and so forth.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`, to
/// keep us from confusing ourselves on whether `>` means numerically greater /
/// less important, or more important / numerically smaller.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

bitflags::bitflags! {
    /// State bits kept in each task slot.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct TaskFlags: u32 {
        /// Slot is allocated.
        const USED = 1 << 0;
        /// Slot may be chosen by the scheduler.
        const EXECUTING = 1 << 1;
        /// Slot belongs to the root (supervisor) task.
        const IS_ROOT = 1 << 2;
        /// Slot is a secondary thread of a process, sharing its parent's
        /// memory regions.
        const IS_THREAD = 1 << 3;
        /// Slot is never preempted by slice expiry.
        const IS_FIFO = 1 << 4;
    }
}

impl TaskFlags {
    /// Flags a task may ask for when creating another task. The rest are the
    /// kernel's to manage.
    pub const REQUESTABLE: Self = Self::IS_THREAD.union(Self::IS_FIFO);
}

/// Operations available through the privileged call gate. The operation
/// number goes in `r0`, arguments in `r1`-`r3`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum GateOp {
    /// Reset the processor. Root only.
    Reset = 0,
    /// Unmask the interrupt in `r1`. Root only.
    IrqEnable = 1,
    /// Mask the interrupt in `r1`. Root only.
    IrqDisable = 2,
    /// Returns the stack pointer task `r1` will resume with.
    ReadStackPointer = 3,
    /// Replaces the saved stack pointer of (non-running) task `r1` with `r2`.
    /// Root only.
    SetStackPointer = 4,
    /// Creates a task described by the `CreateArgs` at `r1`; returns its slot
    /// or `NO_SLOT`.
    CreateTask = 5,
    /// Frees slot `r1`.
    Delete = 6,
    /// Makes task `r1` schedulable (`r2 != 0`) or not (`r2 == 0`).
    SetExecuting = 7,
    /// Sets the priority of task `r1` to `r2`. Root only.
    SetPriority = 8,
    /// Moves the stack guard of task `r1` to base `r2`, size `r3`.
    SetStackGuard = 9,
    /// Makes task `r1` call function `r2` with argument `r3` the next time it
    /// runs, then resume where it was.
    Inject = 10,
    /// Issued by the restore trampoline when an injected call returns.
    Restore = 11,
    /// Gives up the rest of the caller's slice.
    Yield = 12,
    /// Runs allow-listed privileged function `r1` with argument `r2` and
    /// returns its result. Root only.
    ///
    /// The result comes back in `r0` like everything else, so a function
    /// returning `GateError::FLOOR` or above reads as that error. Functions
    /// on the allow-list have to keep their results below it.
    Invoke = 13,
}

/// We're using an explicit `TryFrom` impl for `GateOp` instead of
/// `FromPrimitive` because the kernel doesn't depend on `num-traits` and this
/// seems okay.
impl core::convert::TryFrom<u32> for GateOp {
    type Error = GateError;

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Reset),
            1 => Ok(Self::IrqEnable),
            2 => Ok(Self::IrqDisable),
            3 => Ok(Self::ReadStackPointer),
            4 => Ok(Self::SetStackPointer),
            5 => Ok(Self::CreateTask),
            6 => Ok(Self::Delete),
            7 => Ok(Self::SetExecuting),
            8 => Ok(Self::SetPriority),
            9 => Ok(Self::SetStackGuard),
            10 => Ok(Self::Inject),
            11 => Ok(Self::Restore),
            12 => Ok(Self::Yield),
            13 => Ok(Self::Invoke),
            _ => Err(GateError::BadOperation),
        }
    }
}

/// Recoverable errors returned by the gate, in `r0`.
///
/// Error codes live at the very top of the `u32` space, where no stack
/// address or slot index can land, so a single return register can carry
/// either a value or an error. `NoSlot` is deliberately `NO_SLOT`.
///
/// The one result the kernel doesn't choose is `Invoke`'s, which is whatever
/// the invoked function returned; values from `FLOOR` up are indistinguishable
/// from errors there.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum GateError {
    NoSlot = 0xFFFF_FFFF,
    BadOperation = 0xFFFF_FFFE,
    /// The named slot is out of range or not in use.
    BadTask = 0xFFFF_FFFD,
    /// The caller isn't allowed to do this to that task.
    NotPermitted = 0xFFFF_FFFC,
    /// The requested region can't be encoded.
    BadRegion = 0xFFFF_FFFB,
    /// An injected frame would run off the bottom of the target's stack.
    StackOverflow = 0xFFFF_FFFA,
    /// `Invoke` named a function that isn't on the allow-list.
    NotAllowed = 0xFFFF_FFF9,
    /// The interrupt number doesn't exist on this part.
    BadIrq = 0xFFFF_FFF8,
    /// Stack or layout passed to `CreateTask` is unusable.
    BadLayout = 0xFFFF_FFF7,
}

impl GateError {
    /// Smallest value that `decode_response` treats as an error.
    pub const FLOOR: u32 = 0xFFFF_FFF7;

    /// Splits a gate return value into success or error.
    pub fn decode_response(r0: u32) -> Result<u32, Self> {
        let e = match r0 {
            0xFFFF_FFFF => Self::NoSlot,
            0xFFFF_FFFE => Self::BadOperation,
            0xFFFF_FFFD => Self::BadTask,
            0xFFFF_FFFC => Self::NotPermitted,
            0xFFFF_FFFB => Self::BadRegion,
            0xFFFF_FFFA => Self::StackOverflow,
            0xFFFF_FFF9 => Self::NotAllowed,
            0xFFFF_FFF8 => Self::BadIrq,
            0xFFFF_FFF7 => Self::BadLayout,
            v => return Ok(v),
        };
        Err(e)
    }
}

/// Argument block for `GateOp::CreateTask`, passed by address.
#[derive(
    Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct CreateArgs {
    /// Address of the first instruction (Thumb bit is forced on).
    pub entry: u32,
    /// Where `entry` returns to when it's done.
    pub cleanup: u32,
    /// Passed to `entry` in `r0`.
    pub arg: u32,
    /// Initial stack pointer; the stack grows down from here.
    pub stack_top: u32,
    /// Bytes of stack below `stack_top`.
    pub stack_size: u32,
    /// Initial priority; anything above 0xFF is refused. A task other than
    /// root may not ask for one more important than its own.
    pub priority: u32,
    /// Any of `TaskFlags::REQUESTABLE`.
    pub flags: u32,
    /// Process ID for a new process. Ignored for threads, which inherit the
    /// creator's.
    pub pid: u32,
    /// Opaque per-thread runtime block.
    pub reent: u32,
    /// Opaque per-process runtime block. Equal to `reent` for thread zero.
    pub global_reent: u32,
    /// Code region of a new process. Ignored for threads.
    pub code_base: u32,
    pub code_size: u32,
    /// Data region of a new process. Ignored for threads.
    pub data_base: u32,
    pub data_size: u32,
}

/// A record describing a fault taken by a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum FaultInfo {
    /// The task has violated memory access rules, either in its own code
    /// (`source` `User`) or by handing the kernel an address it can't use
    /// (`source` `Kernel`).
    MemoryAccess {
        /// Problematic address, if the processor could tell us.
        address: Option<u32>,
        source: FaultSource,
    },
    /// A task has overflowed its stack.
    StackOverflow { address: u32 },
    /// A task has induced a bus error.
    BusError {
        address: Option<u32>,
        source: FaultSource,
    },
    DivideByZero,
    /// Attempt to execute non-executable memory.
    IllegalText,
    IllegalInstruction,
    /// Other invalid operation; the code is the Configurable Fault Status
    /// Register.
    InvalidOperation(u32),
    /// Arguments passed to the gate were unusable.
    GateUsage(UsageError),
    /// The task's saved context would have resumed somewhere other than
    /// Thread mode on its own stack.
    CorruptContext { exc_return: u32 },
}

/// Origin of a fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum FaultSource {
    /// User code did something that was intercepted by the processor.
    User,
    /// User code asked the kernel to do something bad on its behalf.
    Kernel,
}

/// Misuses of the gate that are treated as faults rather than errors.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum UsageError {
    /// A pointer argument doesn't lie in memory the caller can reach.
    BadArgumentPointer,
    /// `Restore` was issued without an outstanding injected call, or from
    /// somewhere other than where that call started.
    NoInjectedFrame,
}

impl From<UsageError> for FaultInfo {
    fn from(e: UsageError) -> Self {
        Self::GateUsage(e)
    }
}
