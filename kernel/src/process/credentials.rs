// SPDX-License-Identifier: MPL-2.0

use crate::prelude::*;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(C)]
pub struct Uid(u32);

impl Uid {
    pub const fn new(uid: u32) -> Self {
        Self(uid)
    }

    pub const fn new_root() -> Self {
        Self(ROOT_UID)
    }

    pub const fn is_root(&self) -> bool {
        self.0 == ROOT_UID
    }
}

const ROOT_UID: u32 = 0;

impl From<u32> for Uid {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl From<Uid> for u32 {
    fn from(value: Uid) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(C)]
pub struct Gid(u32);

impl Gid {
    pub const fn new(gid: u32) -> Self {
        Self(gid)
    }

    pub const fn new_root() -> Self {
        Self(ROOT_GID)
    }

    pub const fn is_root(&self) -> bool {
        self.0 == ROOT_GID
    }
}

const ROOT_GID: u32 = 0;

impl From<u32> for Gid {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl From<Gid> for u32 {
    fn from(value: Gid) -> Self {
        value.0
    }
}

bitflags! {
    /// The Linux capabilities consulted by System V IPC.
    ///
    /// Bit positions match `include/uapi/linux/capability.h`.
    pub struct CapSet: u64 {
        const IPC_LOCK = 1 << 14;
        const IPC_OWNER = 1 << 15;
        const SYS_ADMIN = 1 << 21;
        const SYS_RESOURCE = 1 << 24;
    }
}

/// A snapshot of the user and group ids of a task, plus its effective capabilities.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Real user id.
    ruid: Uid,
    /// Effective user id. Used for every permission decision below.
    euid: Uid,
    /// Real group id.
    rgid: Gid,
    /// Effective group id.
    egid: Gid,
    /// Additional groups to which the task belongs.
    supplementary_gids: BTreeSet<Gid>,
    /// Capabilities that the task can actually use.
    effective_capset: CapSet,
}

impl Credentials {
    /// Creates credentials where the real and effective ids are the same.
    ///
    /// The root user gets every capability; other users get none.
    pub fn new(uid: Uid, gid: Gid) -> Self {
        let effective_capset = if uid.is_root() {
            CapSet::all()
        } else {
            CapSet::empty()
        };
        let mut supplementary_gids = BTreeSet::new();
        supplementary_gids.insert(gid);

        Self {
            ruid: uid,
            euid: uid,
            rgid: gid,
            egid: gid,
            supplementary_gids,
            effective_capset,
        }
    }

    pub fn new_root() -> Self {
        Self::new(Uid::new_root(), Gid::new_root())
    }

    pub fn with_supplementary_gids(mut self, gids: impl IntoIterator<Item = Gid>) -> Self {
        self.supplementary_gids.extend(gids);
        self
    }

    pub fn with_capset(mut self, capset: CapSet) -> Self {
        self.effective_capset = capset;
        self
    }

    pub fn ruid(&self) -> Uid {
        self.ruid
    }

    pub fn euid(&self) -> Uid {
        self.euid
    }

    pub fn rgid(&self) -> Gid {
        self.rgid
    }

    pub fn egid(&self) -> Gid {
        self.egid
    }

    pub fn in_group(&self, gid: Gid) -> bool {
        self.egid == gid || self.supplementary_gids.contains(&gid)
    }

    pub fn effective_capset(&self) -> CapSet {
        self.effective_capset
    }

    pub fn capable(&self, cap: CapSet) -> bool {
        self.effective_capset.contains(cap)
    }
}
