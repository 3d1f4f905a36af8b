// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use build_kconfig::{KernelConfig, RegionConfig};

fn main() -> Result<()> {
    build_util::expose_m_profile()?;
    if build_util::target_has_fpu() {
        println!("cargo:rustc-cfg=has_fpu");
    }

    let kconfig: KernelConfig =
        build_util::ron_from_env_or_default("KERN_CONFIG")?;
    kconfig.validate().context("invalid KERN_CONFIG")?;

    generate_statics(&kconfig)
}

fn region(r: &RegionConfig) -> String {
    format!("Span {{ base: {:#010x}, size: {:#010x} }}", r.base, r.size)
}

fn generate_statics(kconfig: &KernelConfig) -> Result<()> {
    let out = &PathBuf::from(
        env::var_os("OUT_DIR").context("OUT_DIR not set by cargo")?,
    );
    let mut file = File::create(out.join("kconfig.rs"))?;

    writeln!(file, "// See build.rs for details")?;
    writeln!(file, "pub const TASK_COUNT: usize = {};", kconfig.task_count)?;
    writeln!(file, "pub const SLICE_TICKS: u32 = {};", kconfig.slice_ticks)?;
    writeln!(file, "pub const MIN_BUDGET: u32 = {};", kconfig.min_budget)?;
    writeln!(
        file,
        "pub const HAS_FPU: bool = {};",
        build_util::target_has_fpu()
    )?;
    writeln!(
        file,
        "pub const KERNEL_RAM: Span = {};",
        region(&kconfig.kernel_ram)
    )?;
    writeln!(
        file,
        "pub const KERNEL_CODE: Span = {};",
        region(&kconfig.kernel_code)
    )?;

    let root = &kconfig.root;
    writeln!(file, "pub const ROOT: RootImage = RootImage {{")?;
    writeln!(file, "    entry: {:#010x},", root.entry_point)?;
    writeln!(file, "    stack_top: {:#010x},", root.stack_top)?;
    writeln!(file, "    stack_size: {:#010x},", root.stack_size)?;
    writeln!(file, "    code: {},", region(&root.code))?;
    writeln!(file, "    data: {},", region(&root.data))?;
    writeln!(file, "    priority: {},", root.priority)?;
    writeln!(file, "}};")?;

    Ok(())
}
