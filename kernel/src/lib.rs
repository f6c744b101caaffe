// SPDX-License-Identifier: MPL-2.0

//! System V inter-process communication for the kernel.
//!
//! This crate owns every System V IPC object of an IPC namespace:
//! semaphore sets, shared-memory segments and message queues.
//! Decrements of semaphores are admitted through a deadlock-avoidance check
//! provided by the [`banker`] crate.
//!
//! The crate does not schedule tasks nor allocate physical memory by itself.
//! It consumes those services through the traits in [`sched`], [`vm`] and
//! [`time`], which the embedding kernel implements.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod ipc;
pub mod prelude;
pub mod process;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod time;
pub mod vm;

#[cfg(test)]
mod test_util;

pub use self::{
    config::{AvoidancePolicy, IpcConfig},
    error::{Errno, Error},
    ipc::{IpcNamespace, KernelServices, init, init_ns},
};
