// SPDX-License-Identifier: MPL-2.0

//! System V semaphore sets.

pub mod sem;
pub mod sem_set;

pub use self::{
    sem::{SemBuf, SemFlags, Semaphore},
    sem_set::{SemaphoreSet, get_or_create_sem_set, remove_sem_set, retry_unsafe_blocked},
};
use crate::ipc::IpcPerm;

/// Semaphore set data structure, as in `struct semid_ds`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SemidDs {
    /// Operation permissions
    pub sem_perm: IpcPerm,
    /// Last semop time
    pub sem_otime: i64,
    /// Reserved for future use
    pub _unused1: u64,
    /// Last change time
    pub sem_ctime: i64,
    /// Reserved for future use
    pub _unused2: u64,
    /// Number of semaphores in the set
    pub sem_nsems: u64,
    /// Reserved for future use
    pub _unused3: u64,
    /// Reserved for future use
    pub _unused4: u64,
}
