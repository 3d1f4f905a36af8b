// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use std::env;

/// Exposes the CPU's M-profile architecture version, which isn't available in
/// rustc's standard environment.
///
/// Sets `cfg(armv7m)` for the Cortex-M3/M4/M7 targets. Host targets are left
/// alone so the kernel can be built and tested against its simulated
/// architecture. Any other bare-metal ARM target is an error: the kernel
/// depends on PMSAv7 region semantics, which ARMv6-M and ARMv8-M don't share.
pub fn expose_m_profile() -> Result<()> {
    let target = env::var("TARGET").context("TARGET not set by cargo")?;

    if target.starts_with("thumbv7m") || target.starts_with("thumbv7em") {
        println!("cargo:rustc-cfg=armv7m");
    } else if target.starts_with("thumb") {
        bail!("unsupported M-profile target {target}");
    }
    Ok(())
}

/// Returns `true` if the target has a hardware floating point unit whose
/// context the kernel must save lazily.
pub fn target_has_fpu() -> bool {
    env::var("TARGET")
        .map(|t| t.ends_with("eabihf"))
        .unwrap_or(false)
}

/// Pulls a RON-encoded configuration out of the environment variable `var`,
/// or uses `T::default()` if the variable is missing. If the variable is
/// present but fails to parse, this still fails with `Err`.
pub fn ron_from_env_or_default<T: DeserializeOwned + Default>(
    var: &str,
) -> Result<T> {
    // Emitted whether or not the var is present, so that we'll be re-run if it
    // becomes present.
    println!("cargo:rerun-if-env-changed={var}");

    let text = match env::var(var) {
        Ok(text) => {
            println!("--- ron for ${var} ---");
            println!("{text}");
            text
        }
        Err(_) => {
            println!("--- var ${var} not present, using default ---");
            return Ok(T::default());
        }
    };
    ron::de::from_str(&text).with_context(|| format!("parsing ${var}"))
}
