// SPDX-License-Identifier: MPL-2.0

//! Semaphores for the system.

pub mod system_v;
