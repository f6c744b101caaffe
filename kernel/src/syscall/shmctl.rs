// SPDX-License-Identifier: MPL-2.0

//! This mod defines the handler to syscall shmctl

use super::{Context, SyscallReturn, check_id};
use crate::{ipc::IpcControlCmd, prelude::*, vm::shared_mem::ShmidDs};

pub fn sys_shmctl(
    shmid: i32,
    cmd: i32,
    buf: Option<&mut ShmidDs>,
    ctx: &Context,
) -> Result<SyscallReturn> {
    check_id(shmid)?;
    let cmd = IpcControlCmd::try_from(cmd)?;
    debug!("[sys_shmctl] shmid = {}, cmd = {:?}", shmid, cmd);

    let shm = ctx.ipc_ns.shm();
    match cmd {
        IpcControlCmd::IPC_RMID => shm.mark_for_removal(shmid, ctx.credentials)?,
        IpcControlCmd::IPC_STAT => {
            let buf = buf.ok_or(Error::with_message(Errno::EFAULT, "IPC_STAT needs a buffer"))?;
            *buf = shm.stat(shmid, ctx.credentials)?;
        }
        IpcControlCmd::IPC_SET => {
            let buf = buf.ok_or(Error::with_message(Errno::EFAULT, "IPC_SET needs a buffer"))?;
            shm.set(shmid, buf, ctx.credentials)?;
        }
        _ => return_errno_with_message!(Errno::EINVAL, "unsupported shmctl command"),
    }

    Ok(SyscallReturn::Return(0))
}
