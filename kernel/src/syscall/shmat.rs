// SPDX-License-Identifier: MPL-2.0

//! This mod defines the handler to syscall shmat

use super::{Context, SyscallReturn, check_id};
use crate::{prelude::*, vm::shared_mem::ShmFlags};

pub fn sys_shmat(shmid: i32, addr: Vaddr, shmflg: i32, ctx: &Context) -> Result<SyscallReturn> {
    let flags = ShmFlags::from_bits_truncate(shmflg as u32);
    debug!(
        "[sys_shmat] shmid = {}, addr = {:#x}, flags = {:?}",
        shmid, addr, flags
    );
    check_id(shmid)?;

    let addr = ctx.ipc_ns.shm().attach(
        shmid,
        addr,
        flags,
        ctx.credentials,
        ctx.pid,
        ctx.vm,
    )?;
    Ok(SyscallReturn::Return(addr as _))
}
