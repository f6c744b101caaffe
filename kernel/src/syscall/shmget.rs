// SPDX-License-Identifier: MPL-2.0

//! This mod defines the handler to syscall shmget

use super::{Context, SyscallReturn, decode_get_flags};
use crate::{ipc::key_t, prelude::*};

pub fn sys_shmget(key: key_t, size: usize, shmflg: i32, ctx: &Context) -> Result<SyscallReturn> {
    let (flags, mode) = decode_get_flags(shmflg);
    debug!(
        "[sys_shmget] key = {}, size = {}, flags = {:?}, mode = {:o}",
        key, size, flags, mode
    );

    let shmid = ctx
        .ipc_ns
        .shm()
        .get_or_create(key, size, flags, mode, ctx.credentials, ctx.pid)?;
    Ok(SyscallReturn::Return(shmid as _))
}
