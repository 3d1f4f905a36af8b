// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel event hooks.
//!
//! The kernel doesn't carry a logger. Instead, a board that wants to watch
//! the kernel work supplies an `EventsTable` from its startup routine, and
//! the kernel calls into it at interesting moments. A typical implementation
//! toggles GPIOs for a logic analyzer, or bumps counters a debugger can read;
//! whatever it does, it runs with the kernel's state half-updated and must be
//! quick and must not call back into the kernel.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Hooks that must be provided by the board setup code if it wants kernel
/// events.
///
/// If you provide an `EventsTable`, you have to provide every hook. To omit
/// one, use something like
///
/// ```ignore
///   tick_isr_enter: || (),
/// ```
pub struct EventsTable {
    /// Called on entry to the call gate, with the operation number.
    pub gate_enter: fn(u32),
    /// Called on the way out of the call gate.
    pub gate_exit: fn(),
    /// Called on entry to the deferred context switch handler.
    pub switch_enter: fn(),
    /// Called on exit from the deferred context switch handler.
    pub switch_exit: fn(),
    /// Called on entry to the slice timer ISR.
    pub tick_isr_enter: fn(),
    /// Called on exit from the slice timer ISR.
    pub tick_isr_exit: fn(),
    /// Called whenever the current task changes, with the index of the task.
    pub context_switch: fn(usize),
    /// Called when every runnable task had spent its slice and budgets were
    /// refilled.
    pub slice_reload: fn(),
    /// Called when a call is injected into a task, with the task's index.
    pub injection: fn(usize),
    /// Called when a task is stopped by a fault, with the task's index.
    pub task_fault: fn(usize),
}

/// Supplies the kernel with an events table.
pub fn configure_events_table(table: &'static EventsTable) {
    EVENTS_TABLE.store(table as *const _ as *mut _, Ordering::Relaxed);
}

/// Written by `configure_events_table`. Null if no table was provided. Any
/// non-null pointer came from a `&'static`.
static EVENTS_TABLE: AtomicPtr<EventsTable> =
    AtomicPtr::new(core::ptr::null_mut());

fn table() -> Option<&'static EventsTable> {
    let p = EVENTS_TABLE.load(Ordering::Relaxed);
    if p.is_null() {
        None
    } else {
        // We only write this pointer from a valid `&'static`, and we're handing
        // out a shared reference, so this should be ok...
        unsafe { Some(&*p) }
    }
}

pub(crate) fn event_gate_enter(op: u32) {
    if let Some(t) = table() {
        (t.gate_enter)(op)
    }
}

pub(crate) fn event_gate_exit() {
    if let Some(t) = table() {
        (t.gate_exit)()
    }
}

#[allow(dead_code)] // only the ARM entry sequence switches this way
pub(crate) fn event_switch_enter() {
    if let Some(t) = table() {
        (t.switch_enter)()
    }
}

#[allow(dead_code)]
pub(crate) fn event_switch_exit() {
    if let Some(t) = table() {
        (t.switch_exit)()
    }
}

#[allow(dead_code)]
pub(crate) fn event_tick_isr_enter() {
    if let Some(t) = table() {
        (t.tick_isr_enter)()
    }
}

#[allow(dead_code)]
pub(crate) fn event_tick_isr_exit() {
    if let Some(t) = table() {
        (t.tick_isr_exit)()
    }
}

pub(crate) fn event_context_switch(idx: usize) {
    if let Some(t) = table() {
        (t.context_switch)(idx)
    }
}

pub(crate) fn event_slice_reload() {
    if let Some(t) = table() {
        (t.slice_reload)()
    }
}

pub(crate) fn event_injection(idx: usize) {
    if let Some(t) = table() {
        (t.injection)(idx)
    }
}

pub(crate) fn event_task_fault(idx: usize) {
    if let Some(t) = table() {
        (t.task_fault)(idx)
    }
}
