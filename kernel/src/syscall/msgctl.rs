// SPDX-License-Identifier: MPL-2.0

use super::{Context, SyscallReturn, check_id};
use crate::{
    ipc::{
        IpcControlCmd, PermissionMode,
        msg_queue::{MsqidDs, remove_msg_queue, set_msg_queue},
    },
    prelude::*,
};

pub fn sys_msgctl(
    msqid: i32,
    cmd: i32,
    buf: Option<&mut MsqidDs>,
    ctx: &Context,
) -> Result<SyscallReturn> {
    check_id(msqid)?;
    let cmd = IpcControlCmd::try_from(cmd)?;
    debug!("[sys_msgctl] msqid = {}, cmd = {:?}", msqid, cmd);

    let ns = ctx.ipc_ns;
    match cmd {
        IpcControlCmd::IPC_RMID => remove_msg_queue(ns, msqid, ctx.credentials)?,
        IpcControlCmd::IPC_STAT => {
            let buf = buf.ok_or(Error::with_message(Errno::EFAULT, "IPC_STAT needs a buffer"))?;
            let msg_queue = ns.msg_ids().get(msqid)?;
            msg_queue.check_access(ctx.credentials, PermissionMode::READ)?;
            *buf = msg_queue.payload().stat(&msg_queue.permission());
        }
        IpcControlCmd::IPC_SET => {
            let buf = buf.ok_or(Error::with_message(Errno::EFAULT, "IPC_SET needs a buffer"))?;
            set_msg_queue(ns, msqid, buf, ctx.credentials)?;
        }
        _ => return_errno_with_message!(Errno::EINVAL, "unsupported msgctl command"),
    }

    Ok(SyscallReturn::Return(0))
}
