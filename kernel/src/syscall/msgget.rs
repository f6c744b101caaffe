// SPDX-License-Identifier: MPL-2.0

use super::{Context, SyscallReturn, decode_get_flags};
use crate::{
    ipc::{key_t, msg_queue::get_or_create_msg_queue},
    prelude::*,
};

pub fn sys_msgget(key: key_t, msgflg: i32, ctx: &Context) -> Result<SyscallReturn> {
    let (flags, mode) = decode_get_flags(msgflg);
    debug!(
        "[sys_msgget] key = {}, flags = {:?}, mode = {:o}",
        key, flags, mode
    );

    let msqid = get_or_create_msg_queue(ctx.ipc_ns, key, flags, mode, ctx.credentials)?;
    Ok(SyscallReturn::Return(msqid as _))
}
