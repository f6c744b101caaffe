// SPDX-License-Identifier: MPL-2.0

use core::time::Duration;

/// A coarse real-time clock.
///
/// The IPC timestamps (`sem_otime`, `shm_atime`, `msg_stime`, ...) have a
/// resolution of one second, so a coarse clock is enough.
pub trait Clock: Send + Sync {
    /// Returns the time elapsed since the Unix epoch.
    fn now(&self) -> Duration;
}
