// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};

/// Board configuration passed into the kernel build.
///
/// This is read by the kernel's build script from the `KERN_CONFIG`
/// environment variable (RON-encoded), and turned into constants.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    /// Number of slots in the task table, including the root slot 0.
    pub task_count: usize,

    /// Length of a round-robin slice, in slice-timer counts.
    pub slice_ticks: u32,

    /// A task whose remaining budget is at or below this is not eligible for
    /// selection until the next reload.
    pub min_budget: u32,

    /// Memory holding the kernel's data. Tasks can read it but not write it.
    pub kernel_ram: RegionConfig,

    /// Memory holding the kernel's code, including the injection restore
    /// trampoline. Tasks can read and execute it.
    pub kernel_code: RegionConfig,

    /// Root task image.
    pub root: RootConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            task_count: 8,
            slice_ticks: 100_000,
            min_budget: 1_000,
            kernel_ram: RegionConfig {
                base: 0x2000_0000,
                size: 0x1_0000,
            },
            kernel_code: RegionConfig {
                base: 0x0000_0000,
                size: 0x2_0000,
            },
            root: RootConfig::default(),
        }
    }
}

/// A single address range.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Address of start of region. On ARMv7-M this must be naturally aligned
    /// for the size, rounded up to a power of two.
    pub base: u32,
    /// Size of region, in bytes.
    pub size: u32,
}

/// Placement of the root (supervisor) task, which occupies slot 0.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RootConfig {
    /// Address of the root task's first instruction.
    pub entry_point: u32,
    /// Initial stack pointer; the stack grows down from here.
    pub stack_top: u32,
    /// Bytes of stack below `stack_top`.
    pub stack_size: u32,
    /// Region the root task executes from.
    pub code: RegionConfig,
    /// Region holding the root task's data and stack.
    pub data: RegionConfig,
    /// Initial priority; smaller numbers are more important.
    pub priority: u8,
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            entry_point: 0x0002_0001,
            stack_top: 0x2001_0800,
            stack_size: 0x800,
            code: RegionConfig {
                base: 0x0002_0000,
                size: 0x2_0000,
            },
            data: RegionConfig {
                base: 0x2001_0000,
                size: 0x1_0000,
            },
            priority: 0xFF,
        }
    }
}

/// Reasons a `KernelConfig` can't be turned into a kernel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigProblem {
    /// The table has no room for anything but the root task.
    TooFewTasks,
    /// The slice doesn't fit in the 24-bit slice timer.
    SliceTooLong,
    /// A slice shorter than the minimum budget would never be eligible.
    SliceBelowMinimum,
}

impl KernelConfig {
    /// Largest slice the SysTick reload register can hold.
    pub const MAX_SLICE: u32 = 1 << 24;

    /// Checks the parts of the configuration that can be checked without
    /// knowing the target's region encoding.
    pub fn validate(&self) -> Result<(), ConfigProblem> {
        if self.task_count < 2 {
            return Err(ConfigProblem::TooFewTasks);
        }
        if self.slice_ticks > Self::MAX_SLICE {
            return Err(ConfigProblem::SliceTooLong);
        }
        if self.slice_ticks <= self.min_budget {
            return Err(ConfigProblem::SliceBelowMinimum);
        }
        Ok(())
    }
}

impl core::fmt::Display for ConfigProblem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::TooFewTasks => f.write_str("task_count must be at least 2"),
            Self::SliceTooLong => write!(
                f,
                "slice_ticks must be at most {}",
                KernelConfig::MAX_SLICE
            ),
            Self::SliceBelowMinimum => {
                f.write_str("slice_ticks must be greater than min_budget")
            }
        }
    }
}

impl std::error::Error for ConfigProblem {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(KernelConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_oversized_slice() {
        let config = KernelConfig {
            slice_ticks: KernelConfig::MAX_SLICE + 1,
            ..KernelConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigProblem::SliceTooLong));
    }

    #[test]
    fn rejects_slice_below_minimum() {
        let config = KernelConfig {
            slice_ticks: 10,
            min_budget: 11,
            ..KernelConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigProblem::SliceBelowMinimum));
    }

    #[test]
    fn rejects_slice_equal_to_minimum() {
        let config = KernelConfig {
            slice_ticks: 500,
            min_budget: 500,
            ..KernelConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigProblem::SliceBelowMinimum));
    }

    #[test]
    fn rejects_root_only_table() {
        let config = KernelConfig {
            task_count: 1,
            ..KernelConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigProblem::TooFewTasks));
    }
}
