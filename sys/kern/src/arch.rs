// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same set
//! of names: a `Hardware` type implementing the kernel's machine traits, and
//! `start_first_task`.

cfg_if::cfg_if! {
    // Note: cfg_if! is slightly touchy about ordering and expression
    // complexity; this chain seems to be the best compromise.

    if #[cfg(all(target_arch = "arm", armv7m))] {
        pub mod arm_m;
        pub use arm_m::*;
    } else if #[cfg(target_arch = "arm")] {
        compile_error!("only ARMv7-M and ARMv7E-M are supported");
    } else {
        pub mod fake;
        pub use fake::*;
    }
}
