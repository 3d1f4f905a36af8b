// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User application support library.
//!
//! This contains call gate stubs, and re-exports the contents of the `abi`
//! crate that gets shared with the kernel.
//!
//! # Gate convention
//!
//! Every operation goes through one `SVC` with the operation number in `r0`
//! and up to three arguments in `r1`-`r3`. The kernel answers in `r0` with
//! either a value or one of the `GateError` codes at the top of the `u32`
//! space. Since all of these are argument registers in the C ABI, a plain
//! `asm!` block can do the whole sequence.
//!
//! There's no `sys_restore`: injected calls return through a trampoline in
//! kernel code that issues it for them.

#![cfg_attr(target_os = "none", no_std)]

pub use abi::*;

/// Issues gate operation `op` with `args`, returning the raw `r0`.
#[inline(always)]
fn gate(op: GateOp, args: [u32; 3]) -> u32 {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "arm")] {
            let mut r0 = op as u32;
            // Safety: the kernel only touches the registers named here, and
            // memory we've handed it by address.
            unsafe {
                core::arch::asm!(
                    "svc #0",
                    inout("r0") r0,
                    in("r1") args[0],
                    in("r2") args[1],
                    in("r3") args[2],
                );
            }
            r0
        } else {
            // There's no kernel to call on the host, so behave like one that
            // doesn't know any operation.
            let _ = (op, args);
            GateError::BadOperation as u32
        }
    }
}

fn gate_result(op: GateOp, args: [u32; 3]) -> Result<u32, GateError> {
    GateError::decode_response(gate(op, args))
}

fn gate_unit(op: GateOp, args: [u32; 3]) -> Result<(), GateError> {
    gate_result(op, args).map(|_| ())
}

/// Resets the processor. Only returns if the caller isn't the root task.
pub fn sys_reset() -> GateError {
    match gate_result(GateOp::Reset, [0; 3]) {
        Err(e) => e,
        Ok(_) => GateError::BadOperation,
    }
}

pub fn sys_irq_enable(irq: u32) -> Result<(), GateError> {
    gate_unit(GateOp::IrqEnable, [irq, 0, 0])
}

pub fn sys_irq_disable(irq: u32) -> Result<(), GateError> {
    gate_unit(GateOp::IrqDisable, [irq, 0, 0])
}

/// Returns the stack pointer `task` will see when it next runs.
pub fn sys_read_stack_pointer(task: usize) -> Result<u32, GateError> {
    gate_result(GateOp::ReadStackPointer, [task as u32, 0, 0])
}

/// Moves another task's saved context to `sp`. Root only.
pub fn sys_set_stack_pointer(task: usize, sp: u32) -> Result<(), GateError> {
    gate_unit(GateOp::SetStackPointer, [task as u32, sp, 0])
}

/// Creates a task, returning its slot. The new task doesn't run until
/// someone calls `sys_set_executing` on it.
pub fn sys_create_task(args: &CreateArgs) -> Result<usize, GateError> {
    let addr = args as *const CreateArgs as usize as u32;
    gate_result(GateOp::CreateTask, [addr, 0, 0]).map(|slot| slot as usize)
}

pub fn sys_delete(task: usize) -> Result<(), GateError> {
    gate_unit(GateOp::Delete, [task as u32, 0, 0])
}

pub fn sys_set_executing(task: usize, on: bool) -> Result<(), GateError> {
    gate_unit(GateOp::SetExecuting, [task as u32, u32::from(on), 0])
}

/// Changes a task's priority. Root only.
pub fn sys_set_priority(task: usize, p: Priority) -> Result<(), GateError> {
    gate_unit(GateOp::SetPriority, [task as u32, u32::from(p.0), 0])
}

/// Makes `size` bytes at `base` inaccessible to `task`. `size` must be a
/// power of two no smaller than 32, and `base` aligned to it.
pub fn sys_set_stack_guard(
    task: usize,
    base: u32,
    size: u32,
) -> Result<(), GateError> {
    gate_unit(GateOp::SetStackGuard, [task as u32, base, size])
}

/// Arranges for `task` to call `function(arg)` the next time it runs, and
/// then carry on from where it was.
pub fn sys_inject(
    task: usize,
    function: extern "C" fn(u32),
    arg: u32,
) -> Result<(), GateError> {
    let f = function as usize as u32;
    gate_unit(GateOp::Inject, [task as u32, f, arg])
}

/// Gives up the rest of this slice.
pub fn sys_yield() {
    // Yield can't fail.
    let _ = gate(GateOp::Yield, [0; 3]);
}

/// Runs one of the kernel's allow-listed privileged functions. Root only.
///
/// A function result of `GateError::FLOOR` or above can't be told apart
/// from an error, and comes back as one.
pub fn sys_invoke(function: u32, arg: u32) -> Result<u32, GateError> {
    gate_result(GateOp::Invoke, [function, arg, 0])
}

/// Builds the arguments for a new thread of the calling process. There's no
/// cleanup routine, so returning from `entry` faults the thread.
///
/// `reent` is the thread's own runtime block and `global_reent` the
/// process's; the kernel refuses a thread whose two are the same, since only
/// thread zero may look like that.
pub fn thread_args(
    entry: extern "C" fn(u32),
    arg: u32,
    stack: &'static mut [u8],
    priority: Priority,
    reent: u32,
    global_reent: u32,
) -> CreateArgs {
    let base = stack.as_mut_ptr() as usize as u32;
    let size = stack.len() as u32;
    CreateArgs {
        entry: entry as usize as u32,
        arg,
        stack_top: base.wrapping_add(size),
        stack_size: size,
        priority: u32::from(priority.0),
        flags: TaskFlags::IS_THREAD.bits(),
        reent,
        global_reent,
        ..CreateArgs::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_gate_rejects_everything() {
        assert_eq!(sys_delete(1), Err(GateError::BadOperation));
        assert_eq!(sys_reset(), GateError::BadOperation);
        assert_eq!(sys_invoke(0, 0), Err(GateError::BadOperation));
    }

    extern "C" fn worker(_: u32) {}

    #[test]
    fn thread_args_carry_both_runtime_blocks() {
        let stack: &'static mut [u8] = Box::leak(Box::new([0u8; 256]));
        let base = stack.as_ptr() as usize as u32;
        let args = thread_args(worker, 3, stack, Priority(2), 0x40, 0x80);
        assert_eq!(args.flags, TaskFlags::IS_THREAD.bits());
        assert_eq!(args.stack_top, base.wrapping_add(256));
        assert_eq!(args.stack_size, 256);
        assert_eq!(args.priority, 2);
        assert_eq!(args.reent, 0x40);
        assert_eq!(args.global_reent, 0x80);
        assert_eq!(args.arg, 3);
    }
}
