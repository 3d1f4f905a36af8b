// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Saved task context, as it sits on a task's stack.
//!
//! A task that isn't running is described entirely by its saved stack
//! pointer, which points at a *saved context*. From low addresses to high:
//!
//! ```text
//!   sp -> SwFrame          r4-r11, EXC_RETURN         (pushed by the kernel)
//!         SwFpExtension    s16-s31                    (only if FP active)
//!         HwFrame          r0-r3, r12, lr, pc, xPSR   (pushed by hardware)
//!         HwFpExtension    s0-s15, FPSCR, reserved    (only if FP active)
//!         padding word                                (only if xPSR[9])
//!         ...the task's stack before the exception...
//! ```
//!
//! "FP active" is bit 4 of EXC_RETURN being *clear*. The hardware reserves the
//! FP extension lazily, and the kernel's entry sequence only pushes s16-s31
//! when it's set, so tasks that never touch the FPU pay nothing for it.
//!
//! Everything in here works on raw addresses. The functions are `unsafe`
//! because the caller has to promise the addresses are mapped, aligned, and
//! belong to the task being manipulated.

use core::mem::size_of;
use core::ptr;

use abi::UsageError;
use static_assertions::const_assert_eq;

/// EXC_RETURN that returns to Thread mode on the process stack, no FP context.
pub const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// EXC_RETURN that returns to Thread mode on the process stack, with FP
/// context.
pub const EXC_RETURN_THREAD_PSP_FP: u32 = 0xFFFF_FFED;

/// EXC_RETURN bit 4: set when the frame does *not* include FP state.
const EXC_RETURN_NO_FP: u32 = 1 << 4;

/// Initial program status register for a fresh task: just the Thumb bit.
pub const INITIAL_PSR: u32 = 1 << 24;

/// xPSR bit 9: hardware inserted a padding word to 8-byte align the frame.
const XPSR_STACK_PADDED: u32 = 1 << 9;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct HwFrame {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub pc: u32,
    pub xpsr: u32,
}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct HwFpExtension {
    pub s: [u32; 16],
    pub fpscr: u32,
    pub reserved: u32,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct SwFrame {
    pub r4: u32,
    pub r5: u32,
    pub r6: u32,
    pub r7: u32,
    pub r8: u32,
    pub r9: u32,
    pub r10: u32,
    pub r11: u32,
    pub exc_return: u32,
}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct SwFpExtension {
    pub s: [u32; 16],
}

const_assert_eq!(size_of::<HwFrame>(), 32);
const_assert_eq!(size_of::<HwFpExtension>(), 72);
const_assert_eq!(size_of::<SwFrame>(), 36);
const_assert_eq!(size_of::<SwFpExtension>(), 64);

impl SwFrame {
    pub fn fpu_active(&self) -> bool {
        self.exc_return & EXC_RETURN_NO_FP == 0
    }

    /// Checks that popping this frame lands in unprivileged Thread mode on
    /// the process stack, which is the only place a task may go.
    pub fn returns_to_task(&self) -> bool {
        matches!(
            self.exc_return,
            EXC_RETURN_THREAD_PSP | EXC_RETURN_THREAD_PSP_FP
        )
    }
}

/// Bytes the kernel's entry sequence pushes below the hardware frame, for a
/// task entering with `exc_return`.
pub fn sw_frame_bytes(exc_return: u32) -> usize {
    let fp = if exc_return & EXC_RETURN_NO_FP == 0 {
        size_of::<SwFpExtension>()
    } else {
        0
    };
    size_of::<SwFrame>() + fp
}

/// Checks that the software frame for a task trapping with `psp` and
/// `exc_return` lands between `floor` and `top`, the part of the stack the
/// kernel may write on the task's behalf.
pub fn sw_frame_fits(
    psp: usize,
    exc_return: u32,
    floor: usize,
    top: usize,
) -> bool {
    psp <= top
        && psp
            .checked_sub(sw_frame_bytes(exc_return))
            .is_some_and(|low| low >= floor)
}

/// Worst-case number of bytes `seed` uses below `stack_top`.
pub const SEED_BYTES: usize = 7 + size_of::<HwFrame>() + size_of::<SwFrame>();

/// Bytes an injection needs beyond the interrupted context, worst case.
pub const INJECT_BYTES: usize =
    8 + size_of::<HwFrame>() + size_of::<SwFrame>();

/// Decoded shape of a saved context.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SavedContext {
    sp: usize,
    fpu: bool,
    padded: bool,
}

impl SavedContext {
    /// Reads the shape of the context saved at `sp`.
    ///
    /// # Safety
    ///
    /// `sp` must point at a complete saved context in readable memory.
    pub unsafe fn at(sp: usize) -> Self {
        let sw = unsafe { ptr::read(sp as *const SwFrame) };
        let fpu = sw.fpu_active();
        let mut ctx = Self {
            sp,
            fpu,
            padded: false,
        };
        let hw = unsafe { ctx.hw() };
        ctx.padded = hw.xpsr & XPSR_STACK_PADDED != 0;
        ctx
    }

    pub fn sp(&self) -> usize {
        self.sp
    }

    pub fn fpu_active(&self) -> bool {
        self.fpu
    }

    fn hw_addr(&self) -> usize {
        let fp = if self.fpu {
            size_of::<SwFpExtension>()
        } else {
            0
        };
        self.sp + size_of::<SwFrame>() + fp
    }

    /// Stack pointer the task will have once this context is popped.
    pub fn end(&self) -> usize {
        let fp = if self.fpu {
            size_of::<HwFpExtension>()
        } else {
            0
        };
        let pad = if self.padded { 4 } else { 0 };
        self.hw_addr() + size_of::<HwFrame>() + fp + pad
    }

    /// # Safety
    ///
    /// The context must still be in place.
    pub unsafe fn sw(&self) -> SwFrame {
        unsafe { ptr::read(self.sp as *const SwFrame) }
    }

    /// # Safety
    ///
    /// The context must still be in place.
    pub unsafe fn hw(&self) -> HwFrame {
        unsafe { ptr::read(self.hw_addr() as *const HwFrame) }
    }

    /// Gate arguments, `r0` through `r3`.
    ///
    /// # Safety
    ///
    /// The context must still be in place.
    pub unsafe fn args(&self) -> [u32; 4] {
        let hw = unsafe { self.hw() };
        [hw.r0, hw.r1, hw.r2, hw.r3]
    }

    /// Overwrites the task's `r0`, which is where gate results go.
    ///
    /// # Safety
    ///
    /// The context must still be in place and writable.
    pub unsafe fn set_return(&self, value: u32) {
        unsafe {
            ptr::write(self.hw_addr() as *mut u32, value);
        }
    }
}

/// Builds the context for a task that has never run, below `stack_top`, and
/// returns the saved stack pointer.
///
/// The task starts at `entry` with `arg` in `r0`, and returns into `cleanup`.
///
/// # Safety
///
/// The `SEED_BYTES` below `stack_top` must be writable and belong to the task.
pub unsafe fn seed(
    stack_top: usize,
    entry: u32,
    cleanup: u32,
    arg: u32,
) -> usize {
    let hw_addr = (stack_top & !7) - size_of::<HwFrame>();
    let hw = HwFrame {
        r0: arg,
        lr: cleanup | 1, // for thumb
        pc: entry | 1,
        xpsr: INITIAL_PSR,
        ..HwFrame::default()
    };
    let sw_addr = hw_addr - size_of::<SwFrame>();
    let sw = SwFrame {
        exc_return: EXC_RETURN_THREAD_PSP,
        ..SwFrame::default()
    };
    unsafe {
        ptr::write(hw_addr as *mut HwFrame, hw);
        ptr::write(sw_addr as *mut SwFrame, sw);
    }
    sw_addr
}

/// A call to be spliced into a task.
#[derive(Copy, Clone, Debug)]
pub struct InjectedCall {
    pub function: u32,
    pub arg: u32,
    /// Where the call returns to; this must issue the restore trap.
    pub restorer: u32,
}

/// Returned when an injected call wouldn't fit on the target's stack.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StackOverflow;

/// The kernel's record of an injected call. It lives with the task, out of
/// the task's reach, so the way back can't be forged from the stack.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Injection {
    /// Stack pointer the call runs with, and so the one its restore trap
    /// must arrive with.
    pub link: usize,
    /// Saved stack pointer of the interrupted context.
    pub interrupted: usize,
}

impl Injection {
    pub const NONE: Self = Self {
        link: 0,
        interrupted: 0,
    };
}

/// Splices `call` in front of the context saved at `sp`, so that popping the
/// returned stack pointer runs `call` first. The existing context is left
/// untouched, and `unwind_injection` gets back to it, given the returned
/// `Injection`, once the call returns into its restorer.
///
/// Only the bytes between the returned pointer and `sp` are written.
///
/// # Safety
///
/// `sp` must point at a complete saved context belonging to the target, and
/// the memory from `stack_base` up to `sp` must be the target's stack.
pub unsafe fn inject(
    sp: usize,
    stack_base: usize,
    call: &InjectedCall,
) -> Result<(usize, Injection), StackOverflow> {
    // The call runs with its stack pointer at `link`, which is 8-byte aligned
    // as the procedure call standard wants, and at least a word below `sp`.
    let link = sp.checked_sub(4).ok_or(StackOverflow)? & !7;
    let hw_addr = link.checked_sub(size_of::<HwFrame>()).ok_or(StackOverflow)?;
    let sw_addr =
        hw_addr.checked_sub(size_of::<SwFrame>()).ok_or(StackOverflow)?;
    if sw_addr < stack_base {
        return Err(StackOverflow);
    }

    let interrupted = unsafe { ptr::read(sp as *const SwFrame) };
    let sw = SwFrame {
        exc_return: EXC_RETURN_THREAD_PSP,
        ..interrupted
    };
    let hw = HwFrame {
        r0: call.arg,
        lr: call.restorer | 1,
        pc: call.function | 1,
        xpsr: INITIAL_PSR,
        ..HwFrame::default()
    };

    unsafe {
        ptr::write(hw_addr as *mut HwFrame, hw);
        ptr::write(sw_addr as *mut SwFrame, sw);
    }
    Ok((
        sw_addr,
        Injection {
            link,
            interrupted: sp,
        },
    ))
}

/// Given the context saved by the restore trap at `sp`, discards it along
/// with the injected call's leftovers and returns the stack pointer of the
/// context `pending` interrupted.
///
/// The trap has to come from where the injected call started; anything
/// else means the call hasn't returned, and the task is confused.
///
/// # Safety
///
/// `sp` must point at a complete saved context in the caller's stack.
pub unsafe fn unwind_injection(
    sp: usize,
    pending: &Injection,
) -> Result<usize, UsageError> {
    let trap = unsafe { SavedContext::at(sp) };
    if trap.end() != pending.link {
        return Err(UsageError::NoInjectedFrame);
    }
    Ok(pending.interrupted)
}
