// SPDX-License-Identifier: MPL-2.0

use bitflags::bitflags;

use crate::ipc::PermissionMode;

bitflags! {
    /// The memory access permissions of memory mappings.
    pub struct VmPerms: u32 {
        /// Readable.
        const READ    = 1 << 0;
        /// Writable.
        const WRITE   = 1 << 1;
        /// Executable.
        const EXEC   = 1 << 2;
    }
}

impl From<VmPerms> for PermissionMode {
    fn from(vm_perms: VmPerms) -> PermissionMode {
        let mut mode = PermissionMode::empty();
        if vm_perms.contains(VmPerms::READ) {
            mode |= PermissionMode::READ;
        }
        if vm_perms.contains(VmPerms::WRITE) {
            mode |= PermissionMode::WRITE;
        }
        if vm_perms.contains(VmPerms::EXEC) {
            mode |= PermissionMode::EXEC;
        }
        mode
    }
}
