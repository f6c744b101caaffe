// SPDX-License-Identifier: MPL-2.0

//! The identity of the tasks that call into the IPC subsystem.

mod credentials;

pub use credentials::{CapSet, Credentials, Gid, Uid};

/// The id of a task. A task is the unit the scheduler blocks and wakes.
pub type Pid = u32;
