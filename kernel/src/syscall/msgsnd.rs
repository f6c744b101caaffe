// SPDX-License-Identifier: MPL-2.0

use super::{Context, SyscallReturn, check_id};
use crate::{
    ipc::{
        PermissionMode,
        msg_queue::{Message, MsgFlags},
    },
    prelude::*,
};

/// The size of `mtype` at the head of `struct msgbuf`.
pub(super) const MTYPE_SIZE: usize = size_of::<i64>();

/// Sends the message in `msgp`, a `struct msgbuf` whose text is `msgsz` bytes long.
pub fn sys_msgsnd(
    msqid: i32,
    msgp: &[u8],
    msgsz: usize,
    msgflg: i32,
    ctx: &Context,
) -> Result<SyscallReturn> {
    let flags = MsgFlags::from_bits_truncate(msgflg);
    debug!(
        "[sys_msgsnd] msqid = {}, msgsz = {}, flags = {:?}",
        msqid, msgsz, flags
    );
    check_id(msqid)?;
    if msgsz > ctx.ipc_ns.config().msg.msgmax {
        return_errno_with_message!(Errno::EINVAL, "the message is larger than MSGMAX");
    }

    let Some((mtype, text)) = MTYPE_SIZE
        .checked_add(msgsz)
        .and_then(|len| msgp.get(..len))
        .map(|msgbuf| msgbuf.split_at(MTYPE_SIZE))
    else {
        return_errno_with_message!(Errno::EFAULT, "the message buffer is too short");
    };
    let mut mtype_bytes = [0; MTYPE_SIZE];
    mtype_bytes.copy_from_slice(mtype);
    let message = Message::new(i64::from_ne_bytes(mtype_bytes), text.to_vec());

    let msg_queue = ctx.ipc_ns.msg_ids().get(msqid)?;
    msg_queue.check_access(ctx.credentials, PermissionMode::WRITE)?;
    msg_queue.payload().send(
        message,
        flags.contains(MsgFlags::IPC_NOWAIT),
        ctx.pid,
        ctx.ipc_ns,
    )?;
    Ok(SyscallReturn::Return(0))
}
