// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Protection unit driver.
//!
//! The kernel uses a fixed assignment of hardware region slots:
//!
//! | slot | contents                                   |
//! |------|--------------------------------------------|
//! | 0    | kernel RAM, tasks may read                 |
//! | 1    | kernel code, tasks may read and execute    |
//! | 2    | current task's code                        |
//! | 3    | current task's data                        |
//! | 4    | current task's stack guard                 |
//!
//! Where regions overlap, the higher-numbered slot wins, which is what lets
//! the stack guard carve a hole out of the data region. Slots 2-4 are
//! rewritten on every context switch; anything above 4 is left disabled.

use kerncore::{RegionDesc, RegionError};

use crate::err::ConfigError;
use crate::task::TaskRegions;

pub const KERNEL_RAM_SLOT: usize = 0;
pub const KERNEL_CODE_SLOT: usize = 1;
pub const TASK_CODE_SLOT: usize = 2;
pub const TASK_DATA_SLOT: usize = 3;
pub const STACK_GUARD_SLOT: usize = 4;

/// Hardware slots the kernel needs to do its job.
pub const REQUIRED_SLOTS: usize = 5;

/// A region-based memory protection unit.
///
/// Implementations own no state beyond the hardware's. Callers keep `slot`
/// below `region_count()`; `checked_apply` is there for callers that can't
/// know that in advance.
pub trait ProtectionUnit {
    /// Number of hardware region slots.
    fn region_count(&self) -> usize;

    /// Turns protection on. Privileged code keeps the default memory map
    /// wherever no region matches.
    fn enable(&mut self);

    /// Turns protection off.
    fn disable(&mut self);

    fn is_enabled(&self) -> bool;

    /// Loads `region` into `slot`.
    fn apply_region(&mut self, slot: usize, region: &RegionDesc);

    /// Makes `slot` match nothing.
    fn clear_region(&mut self, slot: usize) {
        self.apply_region(slot, &RegionDesc::DISABLED);
    }
}

/// Loads `region` into `slot`, if the hardware has such a slot.
pub fn checked_apply(
    mpu: &mut impl ProtectionUnit,
    slot: usize,
    region: &RegionDesc,
) -> Result<(), RegionError> {
    if slot >= mpu.region_count() {
        return Err(RegionError::NoSlot);
    }
    mpu.apply_region(slot, region);
    Ok(())
}

/// Brings the protection unit up with the kernel's own regions in place and
/// every task slot empty.
///
/// The unit is disabled while it's being reprogrammed.
pub fn init(
    mpu: &mut impl ProtectionUnit,
    kernel_ram: &RegionDesc,
    kernel_code: &RegionDesc,
) -> Result<(), ConfigError> {
    let available = mpu.region_count();
    if available < REQUIRED_SLOTS {
        return Err(ConfigError::TooFewRegions { available });
    }

    mpu.disable();
    checked_apply(mpu, KERNEL_RAM_SLOT, kernel_ram)
        .map_err(ConfigError::KernelRam)?;
    checked_apply(mpu, KERNEL_CODE_SLOT, kernel_code)
        .map_err(ConfigError::KernelCode)?;
    for slot in TASK_CODE_SLOT..available {
        mpu.clear_region(slot);
    }
    mpu.enable();
    Ok(())
}

/// Replaces the task regions with `regions`.
///
/// The outgoing task's regions are cleared first, so there's no window in
/// which a mixture of the two tasks' regions is loaded.
pub fn load_task(mpu: &mut impl ProtectionUnit, regions: &TaskRegions) {
    mpu.clear_region(TASK_CODE_SLOT);
    mpu.clear_region(TASK_DATA_SLOT);
    mpu.clear_region(STACK_GUARD_SLOT);

    mpu.apply_region(TASK_CODE_SLOT, &regions.code);
    mpu.apply_region(TASK_DATA_SLOT, &regions.data);
    load_stack_guard(mpu, &regions.stack_guard);
}

pub fn load_stack_guard(mpu: &mut impl ProtectionUnit, guard: &RegionDesc) {
    mpu.apply_region(STACK_GUARD_SLOT, guard);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::FakeMachine;
    use kerncore::{compute_region, AccessPolicy, MemoryClass};

    fn kernel_regions() -> (RegionDesc, RegionDesc) {
        let ram = compute_region(
            0x2000_0000,
            0x1000,
            AccessPolicy::PrivilegedWriteUserRead,
            MemoryClass::Sram,
            false,
        )
        .unwrap();
        let code = compute_region(
            0x0000_0000,
            0x8000,
            AccessPolicy::ReadOnly,
            MemoryClass::Flash,
            true,
        )
        .unwrap();
        (ram, code)
    }

    #[test]
    fn too_few_slots_is_fatal() {
        let mut mpu = FakeMachine::new(4);
        let (ram, code) = kernel_regions();
        assert_eq!(
            init(&mut mpu, &ram, &code),
            Err(ConfigError::TooFewRegions { available: 4 })
        );
        assert!(!mpu.is_enabled());
    }

    #[test]
    fn init_loads_kernel_regions_and_clears_the_rest() {
        let mut mpu = FakeMachine::new(8);
        for slot in 0..8 {
            mpu.apply_region(
                slot,
                &RegionDesc {
                    rbar: 0x1000,
                    rasr: 0x13,
                },
            );
        }
        let (ram, code) = kernel_regions();
        init(&mut mpu, &ram, &code).unwrap();

        assert!(mpu.is_enabled());
        assert_eq!(mpu.region(KERNEL_RAM_SLOT), ram);
        assert_eq!(mpu.region(KERNEL_CODE_SLOT), code);
        for slot in TASK_CODE_SLOT..8 {
            assert_eq!(mpu.region(slot), RegionDesc::DISABLED);
        }
    }

    #[test]
    fn checked_apply_refuses_missing_slot() {
        let mut mpu = FakeMachine::new(8);
        let (ram, _) = kernel_regions();
        assert_eq!(checked_apply(&mut mpu, 8, &ram), Err(RegionError::NoSlot));
        assert_eq!(checked_apply(&mut mpu, 7, &ram), Ok(()));
    }
}
