// SPDX-License-Identifier: MPL-2.0

//! This mod defines the handler to syscall shmdt

use super::{Context, SyscallReturn};
use crate::{prelude::*, vm::shared_mem::SHMLBA};

pub fn sys_shmdt(addr: Vaddr, ctx: &Context) -> Result<SyscallReturn> {
    debug!("[sys_shmdt] addr = {:#x}", addr);

    if addr % SHMLBA != 0 {
        return_errno_with_message!(Errno::EINVAL, "the address is not aligned");
    }
    ctx.ipc_ns.shm().detach(addr, ctx.pid)?;
    Ok(SyscallReturn::Return(0))
}
