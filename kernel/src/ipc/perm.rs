// SPDX-License-Identifier: MPL-2.0

use super::key_t;
use crate::{
    prelude::*,
    process::{CapSet, Gid, Uid},
};

bitflags! {
    /// The access modes of an IPC object, for the owner, the group and the others.
    pub struct PermissionMode: u16 {
        const READ = 0o444;
        const WRITE = 0o222;
        const EXEC = 0o111;
        /// Modifying the values of semaphores.
        const ALTER = 0o222;
    }
}

/// The bits of `mode` that `IPC_SET` may change.
const MODE_MASK: u16 = 0o777;

/// The owner, the creator and the access mode of an IPC object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcPermission {
    key: key_t,
    /// Owner's user ID
    uid: Uid,
    /// Owner's group ID
    gid: Gid,
    /// Creator's user ID
    cuid: Uid,
    /// Creator's group ID
    cgid: Gid,
    mode: u16,
    seq: u16,
}

impl IpcPermission {
    pub(super) fn new(key: key_t, seq: u16, mode: u16, credentials: &Credentials) -> Self {
        Self {
            key,
            uid: credentials.euid(),
            gid: credentials.egid(),
            cuid: credentials.euid(),
            cgid: credentials.egid(),
            mode: mode & MODE_MASK,
            seq,
        }
    }

    pub fn key(&self) -> key_t {
        self.key
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    pub fn cuid(&self) -> Uid {
        self.cuid
    }

    pub fn cgid(&self) -> Gid {
        self.cgid
    }

    pub fn mode(&self) -> u16 {
        self.mode
    }

    pub fn seq(&self) -> u16 {
        self.seq
    }

    /// Checks whether `credentials` grant every access in `requested`.
    ///
    /// The owner bits apply if the caller is the owner or the creator, the group bits
    /// apply if the caller is in the owning or the creating group, and the other bits
    /// apply otherwise. `CAP_IPC_OWNER` overrides the mode.
    pub fn check_access(&self, credentials: &Credentials, requested: PermissionMode) -> Result<()> {
        let flag = requested.bits();
        let requested_mode = (flag >> 6) | (flag >> 3) | flag;

        let euid = credentials.euid();
        let mut granted_mode = self.mode;
        if euid == self.uid || euid == self.cuid {
            granted_mode >>= 6;
        } else if credentials.in_group(self.gid) || credentials.in_group(self.cgid) {
            granted_mode >>= 3;
        }

        if requested_mode & !granted_mode & 0o7 != 0 && !credentials.capable(CapSet::IPC_OWNER) {
            return_errno_with_message!(Errno::EACCES, "the IPC object denies the access");
        }
        Ok(())
    }

    /// Checks whether `credentials` may remove the object or change its permission.
    pub fn check_owner(&self, credentials: &Credentials) -> Result<()> {
        let euid = credentials.euid();
        if euid == self.uid || euid == self.cuid || credentials.capable(CapSet::SYS_ADMIN) {
            return Ok(());
        }
        return_errno_with_message!(Errno::EPERM, "only the owner can control the IPC object")
    }

    /// Changes the owner and the access mode, as `IPC_SET` does.
    pub fn set(&mut self, uid: Uid, gid: Gid, mode: u16) {
        self.uid = uid;
        self.gid = gid;
        self.mode = (self.mode & !MODE_MASK) | (mode & MODE_MASK);
    }

    /// Detaches the key, so the object can only be reached by its id.
    pub(super) fn detach_key(&mut self, extra_mode: u16) {
        self.key = super::IPC_PRIVATE;
        self.mode |= extra_mode;
    }

    pub fn to_c(&self) -> IpcPerm {
        IpcPerm {
            key: self.key,
            uid: self.uid.into(),
            gid: self.gid.into(),
            cuid: self.cuid.into(),
            cgid: self.cgid.into(),
            mode: self.mode,
            seq: self.seq,
            ..Default::default()
        }
    }
}

/// IPC permissions structure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct IpcPerm {
    /// Key
    pub key: i32,
    /// Owner's user ID
    pub uid: u32,
    /// Owner's group ID
    pub gid: u32,
    /// Creator's user ID
    pub cuid: u32,
    /// Creator's group ID
    pub cgid: u32,
    /// Read/write permission
    pub mode: u16,
    /// Padding
    pub _pad1: u16,
    /// Sequence number
    pub seq: u16,
    /// Padding
    pub _pad2: u16,
    /// Reserved for future use
    pub _glibc_reserved1: u64,
    /// Reserved for future use
    pub _glibc_reserved2: u64,
}
