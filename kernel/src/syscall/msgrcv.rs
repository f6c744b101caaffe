// SPDX-License-Identifier: MPL-2.0

use super::{Context, SyscallReturn, check_id, msgsnd::MTYPE_SIZE};
use crate::{
    ipc::{
        PermissionMode,
        msg_queue::{MsgFilter, MsgFlags},
    },
    prelude::*,
};

/// Receives a message into `msgp`, a `struct msgbuf` with room for `msgsz` bytes of text.
///
/// Returns the number of bytes copied into the text.
pub fn sys_msgrcv(
    msqid: i32,
    msgp: &mut [u8],
    msgsz: usize,
    msgtyp: i64,
    msgflg: i32,
    ctx: &Context,
) -> Result<SyscallReturn> {
    let flags = MsgFlags::from_bits_truncate(msgflg);
    debug!(
        "[sys_msgrcv] msqid = {}, msgsz = {}, msgtyp = {}, flags = {:?}",
        msqid, msgsz, msgtyp, flags
    );
    check_id(msqid)?;
    if isize::try_from(msgsz).is_err() {
        return_errno_with_message!(Errno::EINVAL, "msgsz is negative");
    }
    // Nothing larger than MSGMAX is ever queued.
    let msgsz = msgsz.min(ctx.ipc_ns.config().msg.msgmax);

    let Some(msgbuf) = MTYPE_SIZE
        .checked_add(msgsz)
        .and_then(|len| msgp.get_mut(..len))
    else {
        return_errno_with_message!(Errno::EFAULT, "the message buffer is too short");
    };

    let msg_queue = ctx.ipc_ns.msg_ids().get(msqid)?;
    msg_queue.check_access(ctx.credentials, PermissionMode::READ)?;
    let message = msg_queue.payload().receive(
        MsgFilter::new(msgtyp, flags),
        msgsz,
        flags,
        ctx.pid,
        ctx.ipc_ns,
    )?;

    let (mtype, text) = msgbuf.split_at_mut(MTYPE_SIZE);
    mtype.copy_from_slice(&message.mtype().to_ne_bytes());
    text[..message.len()].copy_from_slice(message.text());
    Ok(SyscallReturn::Return(message.len() as _))
}
