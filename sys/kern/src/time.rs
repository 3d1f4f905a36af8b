// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of kernel time.

/// In-kernel timestamp representation.
///
/// Measured in slice-timer counts, accumulated as the scheduler charges
/// tasks for the time they ran.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    /// Returns this timestamp moved `ticks` into the future.
    #[must_use]
    pub fn advanced(self, ticks: u32) -> Self {
        Self(self.0 + u64::from(ticks))
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<[u32; 2]> for Timestamp {
    fn from(v: [u32; 2]) -> Self {
        Self::from(u64::from(v[0]) | u64::from(v[1]) << 32)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

impl From<Timestamp> for [u32; 2] {
    fn from(v: Timestamp) -> Self {
        [v.0 as u32, (v.0 >> 32) as u32]
    }
}
