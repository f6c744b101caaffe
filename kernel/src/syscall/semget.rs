// SPDX-License-Identifier: MPL-2.0

use super::{Context, SyscallReturn, decode_get_flags};
use crate::{
    ipc::{key_t, semaphore::system_v::get_or_create_sem_set},
    prelude::*,
};

pub fn sys_semget(key: key_t, nsems: i32, semflg: i32, ctx: &Context) -> Result<SyscallReturn> {
    if nsems < 0 {
        return_errno_with_message!(Errno::EINVAL, "nsems is negative");
    }
    let (flags, mode) = decode_get_flags(semflg);
    debug!(
        "[sys_semget] key = {}, nsems = {}, flags = {:?}, mode = {:o}",
        key, nsems, flags, mode
    );

    let semid = get_or_create_sem_set(
        ctx.ipc_ns,
        key,
        nsems as usize,
        flags,
        mode,
        ctx.credentials,
    )?;
    Ok(SyscallReturn::Return(semid as _))
}
