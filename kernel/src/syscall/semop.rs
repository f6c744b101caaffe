// SPDX-License-Identifier: MPL-2.0

use super::{Context, SyscallReturn, check_id};
use crate::{
    ipc::{PermissionMode, semaphore::system_v::SemBuf},
    prelude::*,
};

pub fn sys_semop(semid: i32, sops: &[SemBuf], ctx: &Context) -> Result<SyscallReturn> {
    debug!("[sys_semop] semid = {}, nsops = {}", semid, sops.len());

    check_id(semid)?;
    if sops.is_empty() {
        return_errno_with_message!(Errno::EINVAL, "the operation list is empty");
    }
    if sops.len() > ctx.ipc_ns.config().sem.semopm {
        return_errno_with_message!(Errno::E2BIG, "too many operations");
    }

    let sem_set = ctx.ipc_ns.sem_ids().get(semid)?;
    let permission = if sops.iter().any(|sop| sop.sem_op() != 0) {
        PermissionMode::ALTER
    } else {
        PermissionMode::READ
    };
    sem_set.check_access(ctx.credentials, permission)?;

    sem_set
        .payload()
        .semop(semid, sops, ctx.pid, ctx.ipc_ns)?;
    Ok(SyscallReturn::Return(0))
}
