// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A small preemptive kernel for MPU-equipped microcontrollers.
//!
//! This is the application-independent portion of the operating system, and
//! the part that runs in privileged mode. It schedules tasks by priority,
//! sharing time between equals by handing each a budget of timer counts, and
//! keeps each task inside its own memory with the protection unit.
//!
//! The portable parts (everything outside `arch`) are written against a few
//! traits describing the machine, so the whole kernel can be driven on the
//! host by tests.
//!
//! # Design principles
//!
//! 1. Static configuration. The kernel's own layout, the number of task
//!    slots, and the root task are fixed at build time.
//! 2. One task is special. The root task is created at boot, can't be
//!    deleted or stopped, and holds the privileged operations.
//! 3. A strong preference for safe code where reasonable.
//! 4. A preference for simple and clear algorithms over fast and clever
//!    algorithms.

#![cfg_attr(target_os = "none", no_std)]

pub mod arch;
pub mod err;
pub mod fail;
pub mod frame;
pub mod gate;
pub mod kernel;
pub mod mpu;
pub mod profiling;
pub mod sched;
pub mod startup;
pub mod task;
pub mod time;
