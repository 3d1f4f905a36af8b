// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.

use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, Ordering};

use abi::Priority;

use crate::arch;
use crate::fail;
use crate::gate::InvokeFn;
use crate::kernel::{Kernel, KernelParams};
use crate::task::{Span, Task, TaskKind, TaskSpec};

/// The root task, as the image lays it out.
#[derive(Copy, Clone, Debug)]
pub struct RootImage {
    pub entry: u32,
    pub stack_top: u32,
    pub stack_size: u32,
    pub code: Span,
    pub data: Span,
    pub priority: u8,
}

impl RootImage {
    pub fn spec(&self) -> TaskSpec {
        TaskSpec {
            entry: self.entry,
            cleanup: 0,
            arg: 0,
            stack_top: self.stack_top as usize,
            stack_size: self.stack_size as usize,
            priority: Priority(self.priority),
            fifo: false,
            kind: TaskKind::Process {
                pid: 0,
                code: self.code,
                data: self.data,
            },
            reent: 0,
            global_reent: 0,
        }
    }
}

pub const PARAMS: KernelParams = KernelParams {
    slice: SLICE_TICKS,
    min_budget: MIN_BUDGET,
    kernel_ram: KERNEL_RAM,
    kernel_code: KERNEL_CODE,
};

static mut TASK_TABLE: [Task; TASK_COUNT] = [Task::EMPTY; TASK_COUNT];

static mut KERNEL: MaybeUninit<Kernel<'static, arch::Hardware>> =
    MaybeUninit::uninit();

/// Tracks when a mutable reference to the kernel is floating around in
/// kernel code, to prevent production of a second one.
///
/// Notice that this begins life initialized to `true`. This prevents use of
/// `with_kernel` before the kernel is properly started. We set it to `false`
/// late in `start_kernel`.
static KERNEL_IN_USE: AtomicBool = AtomicBool::new(true);

/// The main kernel entry point.
///
/// We expect an application to provide its own `main`-equivalent function,
/// which does basic hardware setup and then calls this function with the
/// machine and the functions the root task may `Invoke`.
///
/// # Safety
///
/// This function has architecture-specific requirements for safe use -- on
/// ARM, for instance, it must be called from the main (interrupt) stack in
/// privileged mode.
///
/// This function may not be called reentrantly or from multiple cores.
pub unsafe fn start_kernel(
    hw: arch::Hardware,
    invoke: &'static [InvokeFn],
) -> ! {
    // Safety: this reference remains unique so long as the "only called
    // once per boot" contract on this function is upheld.
    let tasks = unsafe { &mut *core::ptr::addr_of_mut!(TASK_TABLE) };
    let kernel = Kernel::new(tasks, hw, &PARAMS, invoke)
        .unwrap_or_else(|e| fail::die(e));

    // Safety: as above, and `KERNEL_IN_USE` keeps everyone else out until
    // we're done here.
    let kernel = unsafe { (*core::ptr::addr_of_mut!(KERNEL)).write(kernel) };
    // Safety: the root image describes memory the build gave to the root
    // task.
    let sp = unsafe { kernel.boot_root(&ROOT.spec()) }
        .unwrap_or_else(|e| fail::die(e));

    KERNEL_IN_USE.store(false, Ordering::Release);
    arch::start_first_task(sp)
}

/// Runs `body` with a reference to the kernel.
///
/// To preserve uniqueness of the `&mut` reference passed into `body`, this
/// function will detect any attempts to call it recursively and panic.
#[cfg_attr(not(target_arch = "arm"), allow(dead_code))]
pub(crate) fn with_kernel<R>(
    body: impl FnOnce(&mut Kernel<'static, arch::Hardware>) -> R,
) -> R {
    if KERNEL_IN_USE.swap(true, Ordering::Acquire) {
        panic!(); // recursive use of with_kernel
    }
    // Safety: we have observed `KERNEL_IN_USE` being false, which means the
    // kernel is initialized (note that at reset it starts out true) and that
    // we're not already within a call to with_kernel. Thus, we can produce a
    // reference to it without aliasing.
    let kernel =
        unsafe { (*core::ptr::addr_of_mut!(KERNEL)).assume_init_mut() };

    let r = body(kernel);

    KERNEL_IN_USE.store(false, Ordering::Release);

    r
}

include!(concat!(env!("OUT_DIR"), "/kconfig.rs"));

static_assertions::const_assert!(TASK_COUNT >= 2);
static_assertions::const_assert!(MIN_BUDGET < SLICE_TICKS);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_image_is_process_zero() {
        let image = RootImage {
            entry: 0x0800_0101,
            stack_top: 0x2000_1000,
            stack_size: 0x400,
            code: Span { base: 0x0800_0000, size: 0x1_0000 },
            data: Span { base: 0x2000_0000, size: 0x1000 },
            priority: 3,
        };
        let spec = image.spec();
        assert_eq!(spec.stack_top, 0x2000_1000);
        assert_eq!(spec.stack_size, 0x400);
        assert_eq!(spec.priority, Priority(3));
        assert!(!spec.fifo);
        assert_eq!(
            spec.kind,
            TaskKind::Process {
                pid: 0,
                code: image.code,
                data: image.data,
            }
        );
    }
}
