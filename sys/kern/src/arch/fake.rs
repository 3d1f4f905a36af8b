// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated machine, for running the kernel on the host.
//!
//! Regions are stored rather than enforced, the slice timer only moves when
//! a test says so, and task memory is whatever host memory a test has
//! mapped in.

use abi::GateError;
use kerncore::RegionDesc;

use crate::gate::Platform;
use crate::mpu::ProtectionUnit;
use crate::sched::{SliceTimer, TickMode};

pub type Hardware = FakeMachine;

/// Where injected calls return to. Never executed.
pub const FAKE_RESTORER: u32 = 0x0000_1F00;

const IRQ_COUNT: usize = 32;

#[derive(Copy, Clone, Debug)]
struct Mapping {
    addr: u32,
    host: usize,
    len: usize,
}

#[derive(Debug)]
pub struct FakeMachine {
    regions: Vec<RegionDesc>,
    enabled: bool,
    elapsed: u32,
    armed: Option<TickMode>,
    irqs: [bool; IRQ_COUNT],
    mappings: Vec<Mapping>,
    reent: usize,
    stack: (usize, usize),
}

impl FakeMachine {
    /// Makes a machine whose protection unit has `region_count` slots, all
    /// disabled.
    pub fn new(region_count: usize) -> Self {
        Self {
            regions: vec![RegionDesc::DISABLED; region_count],
            enabled: false,
            elapsed: 0,
            armed: None,
            irqs: [false; IRQ_COUNT],
            mappings: vec![],
            reent: 0,
            stack: (0, 0),
        }
    }

    pub fn region(&self, slot: usize) -> RegionDesc {
        self.regions[slot]
    }

    /// Lets `ticks` counts pass on the slice timer.
    pub fn advance(&mut self, ticks: u32) {
        self.elapsed += ticks;
    }

    pub fn armed(&self) -> Option<TickMode> {
        self.armed
    }

    pub fn irq_enabled(&self, irq: usize) -> bool {
        self.irqs[irq]
    }

    /// Makes `len` bytes of host memory at `host` appear at task address
    /// `addr`.
    pub fn map(&mut self, addr: u32, host: usize, len: usize) {
        self.mappings.push(Mapping { addr, host, len });
    }

    pub fn published_reentrancy(&self) -> usize {
        self.reent
    }

    /// Floor and top of the stack region last published.
    pub fn published_stack(&self) -> (usize, usize) {
        self.stack
    }
}

impl ProtectionUnit for FakeMachine {
    fn region_count(&self) -> usize {
        self.regions.len()
    }

    fn enable(&mut self) {
        self.enabled = true;
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn apply_region(&mut self, slot: usize, region: &RegionDesc) {
        self.regions[slot] = *region;
    }
}

impl SliceTimer for FakeMachine {
    fn take_elapsed(&mut self) -> u32 {
        core::mem::take(&mut self.elapsed)
    }

    fn arm(&mut self, mode: TickMode) {
        self.armed = Some(mode);
    }
}

impl Platform for FakeMachine {
    fn set_irq_enabled(&mut self, irq: u32, on: bool) -> Result<(), GateError> {
        let slot = self
            .irqs
            .get_mut(irq as usize)
            .ok_or(GateError::BadIrq)?;
        *slot = on;
        Ok(())
    }

    fn reset(&mut self) -> ! {
        panic!("SYSTEM RESET");
    }

    fn restore_trampoline(&self) -> u32 {
        FAKE_RESTORER
    }

    fn translate(&self, addr: u32, len: usize) -> Option<usize> {
        self.mappings.iter().find_map(|m| {
            let offset = addr.checked_sub(m.addr)? as usize;
            (offset.checked_add(len)? <= m.len).then_some(m.host + offset)
        })
    }

    fn publish_reentrancy(&mut self, reent: usize) {
        self.reent = reent;
    }

    fn publish_stack(&mut self, floor: usize, top: usize) {
        self.stack = (floor, top);
    }
}

/// There's no userland to enter on the host.
pub fn start_first_task(_sp: usize) -> ! {
    panic!("entering userland");
}
