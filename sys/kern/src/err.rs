// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Gate operations return `Result<_, UserError>` and let the gate decide what
//! the task sees, so the operations themselves can use `?` freely.

use core::fmt;

use abi::{FaultInfo, GateError, UsageError};
use kerncore::RegionError;

use crate::sched::NextTask;
use crate::task::CreateError;

/// An error committed by a task when using the gate.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UserError {
    /// Reported back to the task as a response code in `r0`. May still cause
    /// a context switch, as indicated by the `NextTask`.
    Recoverable(GateError, NextTask),
    /// Turned into a fault against the task, which stops running.
    Unrecoverable(FaultInfo),
}

impl From<GateError> for UserError {
    fn from(e: GateError) -> Self {
        Self::Recoverable(e, NextTask::Same)
    }
}

impl From<FaultInfo> for UserError {
    fn from(f: FaultInfo) -> Self {
        Self::Unrecoverable(f)
    }
}

impl From<UsageError> for UserError {
    fn from(e: UsageError) -> Self {
        Self::Unrecoverable(e.into())
    }
}

impl From<RegionError> for UserError {
    fn from(_: RegionError) -> Self {
        GateError::BadRegion.into()
    }
}

impl From<CreateError> for UserError {
    fn from(e: CreateError) -> Self {
        let code = match e {
            CreateError::NoSlot => GateError::NoSlot,
            CreateError::BadStack => GateError::BadLayout,
            CreateError::Region(_) => GateError::BadRegion,
        };
        code.into()
    }
}

/// Problems found while bringing the kernel up. All of these are fatal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    /// The protection unit doesn't have enough slots for the kernel's layout.
    TooFewRegions { available: usize },
    /// The kernel RAM region can't be encoded.
    KernelRam(RegionError),
    /// The kernel code region can't be encoded.
    KernelCode(RegionError),
    /// The root task couldn't be set up.
    RootTask(CreateError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooFewRegions { available } => {
                write!(f, "MPU has {available} regions, need 5")
            }
            Self::KernelRam(e) => write!(f, "kernel RAM region: {e:?}"),
            Self::KernelCode(e) => write!(f, "kernel code region: {e:?}"),
            Self::RootTask(e) => write!(f, "root task: {e:?}"),
        }
    }
}
