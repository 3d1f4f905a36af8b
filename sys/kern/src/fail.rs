// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recording kernel failures where tooling can find them.
//!
//! This module defines the following binary interface to debuggers:
//!
//! - `KERNEL_HAS_FAILED` is a `bool`. It is false until the kernel reaches
//!   `die`, either explicitly (bad configuration, a fault in the kernel or in
//!   the root task) or as a result of a `panic!`.
//!
//! - `KERNEL_EPITAPH` is an array of `u8`. `die` writes as much of the
//!   failure reason into it (as UTF-8) as fits, and trailing NULs should be
//!   trimmed when printing.
//!
//! On the host there's no debugger to read these, so `die` panics instead.

use core::fmt::Display;
#[cfg(target_os = "none")]
use core::{fmt::Write, sync::atomic::Ordering};

/// Set by `die`, so tools have a one-stop-shop for doing kernel triage.
#[cfg(target_os = "none")]
#[used]
#[no_mangle]
static mut KERNEL_HAS_FAILED: bool = false;

#[cfg(target_os = "none")]
const EPITAPH_LEN: usize = 128;

/// Up to `EPITAPH_LEN` bytes describing why the kernel died, NUL-padded.
#[cfg(target_os = "none")]
#[used]
#[no_mangle]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

#[cfg(target_os = "none")]
fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    // Safety: the kernel runs with every entry point at the same priority, so
    // nothing can interrupt us between the replace and the check.
    let previous_fail = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if previous_fail {
        // Recursive failure. Panicking again would only make it worse.
        loop {
            core::sync::atomic::fence(Ordering::SeqCst);
        }
    }

    // Safety: only one execution of this function gets past the flag.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[cfg(target_os = "none")]
#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    let buf = begin_epitaph();
    let mut writer = Eulogist { dest: buf };
    write!(writer, "{msg}").ok();

    loop {
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

#[cfg(not(target_os = "none"))]
#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    panic!("kernel died: {msg}")
}

/// Writes into the epitaph, dropping whatever doesn't fit.
#[cfg(target_os = "none")]
struct Eulogist {
    dest: &'static mut [u8],
}

#[cfg(target_os = "none")]
impl Write for Eulogist {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = core::mem::take(&mut self.dest).split_at_mut(n);
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
