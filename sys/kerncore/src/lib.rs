// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-level kernel arithmetic that doesn't touch hardware.
//!
//! The main thing in here is the PMSAv7 region calculator, which turns a
//! requested `(base, size, access, class, executable)` tuple into the pair of
//! words the MPU wants (`RBAR`/`RASR`), plus the inverse checks the kernel
//! uses when a task hands it an address.
//!
//! Everything here is pure, so it's tested on the host.

// Allow std-y things to be used in test. Note that this attribute is a bit of a
// trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]
#![forbid(clippy::wildcard_imports)]

/// Smallest region the hardware can describe.
pub const MIN_REGION_SIZE: u32 = 32;

/// Largest region we're willing to describe. (The hardware can do 4 GiB, but
/// nothing a task asks for should be that large, and refusing it keeps the
/// rounding arithmetic inside `u32`.)
pub const MAX_REGION_SIZE: u32 = 1 << 31;

/// Regions at least this big are split into eight equal sub-regions that can
/// be individually disabled.
pub const SUBREGION_THRESHOLD: u32 = 256;

const RASR_ENABLE: u32 = 1;
const RASR_SIZE_SHIFT: u32 = 1;
const RASR_SRD_SHIFT: u32 = 8;
const RASR_B: u32 = 1 << 16;
const RASR_C: u32 = 1 << 17;
const RASR_S: u32 = 1 << 18;
const RASR_TEX_SHIFT: u32 = 19;
const RASR_AP_SHIFT: u32 = 24;
const RASR_XN: u32 = 1 << 28;

const RBAR_ADDR_MASK: u32 = !0x1F;

/// Who may do what with a region.
///
/// These correspond to the PMSAv7 `AP` encodings that we actually use; the
/// deprecated and reserved encodings are deliberately not representable.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AccessPolicy {
    /// Nobody, including privileged code.
    NoAccess,
    /// Privileged read/write, tasks fault.
    PrivilegedOnly,
    /// Privileged read/write, tasks read-only.
    PrivilegedWriteUserRead,
    /// Everybody reads and writes.
    FullAccess,
    /// Everybody reads, nobody writes.
    ReadOnly,
}

impl AccessPolicy {
    const fn ap_bits(self) -> u32 {
        match self {
            Self::NoAccess => 0b000,
            Self::PrivilegedOnly => 0b001,
            Self::PrivilegedWriteUserRead => 0b010,
            Self::FullAccess => 0b011,
            Self::ReadOnly => 0b110,
        }
    }

    const fn from_ap_bits(ap: u32) -> Option<Self> {
        match ap {
            0b000 => Some(Self::NoAccess),
            0b001 => Some(Self::PrivilegedOnly),
            0b010 => Some(Self::PrivilegedWriteUserRead),
            0b011 => Some(Self::FullAccess),
            0b110 => Some(Self::ReadOnly),
            _ => None,
        }
    }

    /// Checks whether unprivileged code may read through this policy.
    pub const fn user_can_read(self) -> bool {
        matches!(
            self,
            Self::PrivilegedWriteUserRead | Self::FullAccess | Self::ReadOnly
        )
    }

    /// Checks whether unprivileged code may write through this policy.
    pub const fn user_can_write(self) -> bool {
        matches!(self, Self::FullAccess)
    }
}

/// What kind of memory sits behind a region. This controls the cache and
/// ordering attributes (`TEX`, `S`, `C`, `B`).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryClass {
    /// On-chip flash: normal memory, write-through.
    Flash,
    /// On-chip SRAM: normal memory, write-back with allocation.
    Sram,
    /// Off-chip SRAM: normal memory, write-back, shareable.
    ExternalSram,
    /// Memory-mapped registers: shareable device memory.
    Peripheral,
}

impl MemoryClass {
    /// Returns `(TEX, S | C | B)` for this class, already shifted into place.
    const fn attribute_bits(self) -> u32 {
        match self {
            Self::Flash => (0b000 << RASR_TEX_SHIFT) | RASR_C,
            Self::Sram => (0b001 << RASR_TEX_SHIFT) | RASR_C | RASR_B,
            Self::ExternalSram => RASR_S | RASR_C | RASR_B,
            Self::Peripheral => RASR_S | RASR_B,
        }
    }

    fn from_attribute_bits(rasr: u32) -> Option<Self> {
        const MASK: u32 = (0b111 << RASR_TEX_SHIFT) | RASR_S | RASR_C | RASR_B;
        [Self::Flash, Self::Sram, Self::ExternalSram, Self::Peripheral]
            .into_iter()
            .find(|c| c.attribute_bits() == rasr & MASK)
    }
}

/// Reasons a region can't be encoded.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionError {
    /// The base address isn't aligned to the (rounded-up) region size.
    Misaligned,
    /// A zero-byte region was requested.
    TooSmall,
    /// The size is larger than `MAX_REGION_SIZE`.
    TooLarge,
    /// The protection unit has no slot at the requested index.
    NoSlot,
}

/// An encoded region, ready to be loaded into the protection unit.
///
/// `rbar` holds only the base address; the driver ORs in the slot number and
/// `VALID` bit when it loads the region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegionDesc {
    pub rbar: u32,
    pub rasr: u32,
}

impl RegionDesc {
    /// A region that matches nothing.
    pub const DISABLED: Self = Self { rbar: 0, rasr: 0 };

    pub const fn is_enabled(&self) -> bool {
        self.rasr & RASR_ENABLE != 0
    }

    pub const fn base(&self) -> u32 {
        self.rbar & RBAR_ADDR_MASK
    }

    /// Full (power-of-two) size of the region, ignoring any disabled
    /// sub-regions. Zero for a disabled region.
    pub const fn size(&self) -> u64 {
        if !self.is_enabled() {
            return 0;
        }
        let field = (self.rasr >> RASR_SIZE_SHIFT) & 0x1F;
        1 << (field + 1)
    }

    /// Sub-region disable mask; bit `n` set means the `n`th eighth of the
    /// region is not covered.
    pub const fn subregion_mask(&self) -> u8 {
        (self.rasr >> RASR_SRD_SHIFT) as u8
    }

    pub fn access(&self) -> Option<AccessPolicy> {
        AccessPolicy::from_ap_bits((self.rasr >> RASR_AP_SHIFT) & 0b111)
    }

    pub fn memory_class(&self) -> Option<MemoryClass> {
        MemoryClass::from_attribute_bits(self.rasr)
    }

    pub const fn executable(&self) -> bool {
        self.rasr & RASR_XN == 0
    }

    /// Number of bytes, starting at `base`, actually covered. Only the top
    /// sub-regions are ever disabled by `compute_region`, so this is also the
    /// requested size rounded up to a sub-region boundary.
    pub fn covered_len(&self) -> u64 {
        let size = self.size();
        let mask = self.subregion_mask();
        if size < u64::from(SUBREGION_THRESHOLD) || mask == 0 {
            return size;
        }
        let eighth = size / 8;
        let enabled = (0..8).take_while(|n| mask & (1 << n) == 0).count();
        eighth * enabled as u64
    }

    /// Checks whether this region matches `addr`, honoring disabled
    /// sub-regions.
    pub fn contains(&self, addr: u64) -> bool {
        let base = u64::from(self.base());
        let size = self.size();
        if addr < base || addr >= base + size {
            return false;
        }
        if size < u64::from(SUBREGION_THRESHOLD) {
            return true;
        }
        let n = (addr - base) / (size / 8);
        self.subregion_mask() & (1 << n) == 0
    }

    /// Checks whether every byte of `[start, end)` is matched by this region.
    fn covers(&self, start: u64, end: u64) -> bool {
        let base = u64::from(self.base());
        if start < base || end > base + self.size() {
            return false;
        }
        if self.size() < u64::from(SUBREGION_THRESHOLD) {
            return true;
        }
        let eighth = self.size() / 8;
        let first = (start - base) / eighth;
        let last = (end - 1 - base) / eighth;
        (first..=last).all(|n| self.subregion_mask() & (1 << n) == 0)
    }

    /// Checks whether `[start, end)` has any byte in common with this region.
    fn overlaps(&self, start: u64, end: u64) -> bool {
        let base = u64::from(self.base());
        self.is_enabled() && start < base + self.covered_len() && base < end
    }
}

/// Encodes a protection region.
///
/// `size` is rounded up to the next power of two no smaller than
/// `MIN_REGION_SIZE`, and `base` must be aligned to the rounded size. When
/// `size` itself wasn't a power of two and the rounded region is big enough to
/// have sub-regions, the eighths that lie entirely past `base + size` are
/// disabled, so the region covers `size` rounded up to an eighth rather than
/// the whole power of two.
///
/// The region is execute-never unless `executable` is set.
pub fn compute_region(
    base: u32,
    size: u32,
    access: AccessPolicy,
    class: MemoryClass,
    executable: bool,
) -> Result<RegionDesc, RegionError> {
    if size == 0 {
        return Err(RegionError::TooSmall);
    }
    if size > MAX_REGION_SIZE {
        return Err(RegionError::TooLarge);
    }

    let rounded = rounded_region_size(size);
    if base & (rounded - 1) != 0 {
        return Err(RegionError::Misaligned);
    }

    let srd = if !size.is_power_of_two() && rounded >= SUBREGION_THRESHOLD {
        let eighth = rounded / 8;
        let enabled = size.div_ceil(eighth);
        // `enabled` is in 2..=8 here; 8 means the rounding was already
        // within the last eighth and every sub-region stays on.
        (0xFF_u32 << enabled) & 0xFF
    } else {
        0
    };

    let l2size = rounded.trailing_zeros();
    let xn = if executable { 0 } else { RASR_XN };

    let rasr = xn
        | access.ap_bits() << RASR_AP_SHIFT
        | class.attribute_bits()
        | srd << RASR_SRD_SHIFT
        | (l2size - 1) << RASR_SIZE_SHIFT
        | RASR_ENABLE;

    Ok(RegionDesc { rbar: base, rasr })
}

/// The power-of-two size `compute_region` will use for a request of `size`
/// bytes. `size` must be in `1..=MAX_REGION_SIZE`.
pub fn rounded_region_size(size: u32) -> u32 {
    size.max(MIN_REGION_SIZE).next_power_of_two()
}

/// Decides whether unprivileged code running under `table` could touch every
/// byte of `[base, base + len)`.
///
/// `table` is in protection-unit slot order. As on the hardware, where
/// regions overlap the highest-numbered one wins, so a later region that
/// touches the range must itself grant the access and cover the whole range.
/// This is conservative: a range that the hardware would allow by stitching
/// several regions together is refused.
///
/// Empty ranges confer no authority and are always accepted.
pub fn user_can_access(
    table: &[RegionDesc],
    base: usize,
    len: usize,
    write: bool,
) -> bool {
    if len == 0 {
        return true;
    }
    let start = base as u64;
    let Some(end) = start.checked_add(len as u64) else {
        return false;
    };

    for region in table.iter().rev() {
        if !region.overlaps(start, end) {
            continue;
        }
        let granted = match region.access() {
            Some(a) if write => a.user_can_write(),
            Some(a) => a.user_can_read(),
            None => false,
        };
        return granted && region.covers(start, end);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sram(base: u32, size: u32) -> Result<RegionDesc, RegionError> {
        compute_region(
            base,
            size,
            AccessPolicy::FullAccess,
            MemoryClass::Sram,
            false,
        )
    }

    #[test]
    fn misaligned_base_is_refused() {
        assert_eq!(sram(0x1001, 256), Err(RegionError::Misaligned));
        assert_eq!(sram(0x2000_0100, 0x1000), Err(RegionError::Misaligned));
    }

    #[test]
    fn zero_size_is_refused() {
        assert_eq!(sram(0x2000_0000, 0), Err(RegionError::TooSmall));
    }

    #[test]
    fn oversized_is_refused() {
        assert_eq!(sram(0, (1 << 31) + 1), Err(RegionError::TooLarge));
        assert_eq!(sram(0, u32::MAX), Err(RegionError::TooLarge));
        assert!(sram(0, 1 << 31).is_ok());
    }

    #[test]
    fn tiny_sizes_round_to_minimum() {
        let r = sram(0x2000_0020, 1).unwrap();
        assert_eq!(r.size(), 32);
        assert_eq!(r.base(), 0x2000_0020);
        assert_eq!(r.subregion_mask(), 0);
    }

    #[test]
    fn encodes_known_rasr() {
        // 1 KiB of flash, user read-only, executable.
        let r = compute_region(
            0x0800_0400,
            1024,
            AccessPolicy::ReadOnly,
            MemoryClass::Flash,
            true,
        )
        .unwrap();
        assert_eq!(r.rbar, 0x0800_0400);
        // AP=110, TEX=000 C=1, SIZE=9, ENABLE.
        assert_eq!(r.rasr, 0b110 << 24 | 1 << 17 | 9 << 1 | 1);
        assert!(r.executable());
        assert_eq!(r.access(), Some(AccessPolicy::ReadOnly));
        assert_eq!(r.memory_class(), Some(MemoryClass::Flash));
    }

    #[test]
    fn peripheral_is_execute_never_device() {
        let r = compute_region(
            0x4000_0000,
            0x400,
            AccessPolicy::PrivilegedOnly,
            MemoryClass::Peripheral,
            false,
        )
        .unwrap();
        assert!(!r.executable());
        assert_eq!(r.memory_class(), Some(MemoryClass::Peripheral));
        assert_eq!(r.access(), Some(AccessPolicy::PrivilegedOnly));
    }

    #[test]
    fn excess_subregions_are_disabled() {
        // 5 KiB rounds to 8 KiB; eighths are 1 KiB; five stay on.
        let r = sram(0x2000_0000, 5 * 1024).unwrap();
        assert_eq!(r.size(), 8 * 1024);
        assert_eq!(r.subregion_mask(), 0b1110_0000);
        assert_eq!(r.covered_len(), 5 * 1024);
        assert!(r.contains(0x2000_13FF));
        assert!(!r.contains(0x2000_1400));
    }

    #[test]
    fn partial_eighth_keeps_its_subregion() {
        // 300 bytes rounds to 512; eighths are 64; ceil(300/64) = 5.
        let r = sram(0x2000_0000, 300).unwrap();
        assert_eq!(r.subregion_mask(), 0b1110_0000);
        assert_eq!(r.covered_len(), 320);
    }

    #[test]
    fn small_non_power_of_two_has_no_subregions() {
        let r = sram(0x2000_0000, 100).unwrap();
        assert_eq!(r.size(), 128);
        assert_eq!(r.subregion_mask(), 0);
    }

    #[test]
    fn disabled_region_matches_nothing() {
        let r = RegionDesc::DISABLED;
        assert!(!r.is_enabled());
        assert_eq!(r.size(), 0);
        assert!(!r.contains(0));
    }

    #[test]
    fn user_access_follows_policy() {
        let code = compute_region(
            0x0001_0000,
            0x1000,
            AccessPolicy::ReadOnly,
            MemoryClass::Flash,
            true,
        )
        .unwrap();
        let data = sram(0x2000_0000, 0x1000).unwrap();
        let table = [code, data];

        assert!(user_can_access(&table, 0x0001_0010, 16, false));
        assert!(!user_can_access(&table, 0x0001_0010, 16, true));
        assert!(user_can_access(&table, 0x2000_0ff0, 16, true));
        // Runs off the end of the data region.
        assert!(!user_can_access(&table, 0x2000_0ff0, 17, true));
        // Not mapped at all.
        assert!(!user_can_access(&table, 0x3000_0000, 4, false));
        // Empty is fine anywhere.
        assert!(user_can_access(&table, 0x3000_0000, 0, true));
        // Wraps the address space.
        assert!(!user_can_access(&table, usize::MAX, 2, false));
    }

    #[test]
    fn later_region_overrides_earlier() {
        let data = sram(0x2000_0000, 0x1000).unwrap();
        let guard = compute_region(
            0x2000_0000,
            32,
            AccessPolicy::NoAccess,
            MemoryClass::Sram,
            false,
        )
        .unwrap();
        let table = [data, guard];

        assert!(!user_can_access(&table, 0x2000_0000, 4, false));
        assert!(!user_can_access(&table, 0x2000_001c, 8, false));
        assert!(user_can_access(&table, 0x2000_0020, 8, true));
    }

    #[test]
    fn disabled_subregions_are_not_accessible() {
        let data = sram(0x2000_0000, 5 * 1024).unwrap();
        assert!(user_can_access(&[data], 0x2000_1000, 0x400, true));
        assert!(!user_can_access(&[data], 0x2000_1000, 0x401, true));
    }

    proptest! {
        #[test]
        fn rounded_size_is_smallest_power_of_two(
            size in 1u32..=MAX_REGION_SIZE
        ) {
            let rounded = rounded_region_size(size);
            prop_assert!(rounded.is_power_of_two());
            prop_assert!(rounded >= size.max(MIN_REGION_SIZE));
            prop_assert!(rounded / 2 < size.max(MIN_REGION_SIZE));

            let r = sram(0, size).unwrap();
            prop_assert_eq!(r.size(), u64::from(rounded));
            prop_assert!(r.covered_len() >= u64::from(size));
        }

        #[test]
        fn misaligned_base_is_never_ok(
            size in 1u32..=MAX_REGION_SIZE,
            base: u32
        ) {
            let rounded = rounded_region_size(size);
            let result = sram(base, size);
            if base % rounded == 0 {
                prop_assert!(result.is_ok());
            } else {
                prop_assert_eq!(result, Err(RegionError::Misaligned));
            }
        }

        #[test]
        fn covered_bytes_match_request(size in 1u32..=0x10_0000) {
            let r = sram(0, size).unwrap();
            prop_assert!(r.contains(u64::from(size) - 1));
            prop_assert!(!r.contains(r.covered_len()));
        }
    }
}
