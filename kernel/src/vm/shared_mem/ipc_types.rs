// SPDX-License-Identifier: MPL-2.0

//! This mod defines the types used in shared-memory control operations

use crate::ipc::IpcPerm;

/// Shared memory segment data structure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ShmidDs {
    /// Operation permissions
    pub shm_perm: IpcPerm,
    /// Size of segment in bytes
    pub shm_segsz: usize,
    /// Last attach time
    pub shm_atime: i64,
    /// Last detach time
    pub shm_dtime: i64,
    /// Last change time
    pub shm_ctime: i64,
    /// PID of creator
    pub shm_cpid: i32,
    /// PID of last operator
    pub shm_lpid: i32,
    /// Number of current attaches
    pub shm_nattch: u64,
    /// Reserved for future use
    pub _glibc_reserved5: u64,
    /// Reserved for future use
    pub _glibc_reserved6: u64,
}
