// SPDX-License-Identifier: MPL-2.0

use super::{Context, SyscallReturn, check_id};
use crate::{
    ipc::{
        IpcControlCmd, PermissionMode,
        semaphore::system_v::{SemaphoreSet, SemidDs, remove_sem_set},
    },
    prelude::*,
};

/// The fourth argument of `semctl()`, as in `union semun`.
#[derive(Debug)]
pub enum SemunArg<'a> {
    None,
    /// For `SETVAL`
    Val(i32),
    /// For `GETALL`, `SETALL` and `SEM_SETCLAIM`
    Array(&'a mut [u16]),
    /// For `IPC_STAT` and `IPC_SET`
    Ds(&'a mut SemidDs),
}

pub fn sys_semctl(
    semid: i32,
    semnum: i32,
    cmd: i32,
    arg: SemunArg,
    ctx: &Context,
) -> Result<SyscallReturn> {
    check_id(semid)?;
    if semnum < 0 {
        return_errno!(Errno::EINVAL)
    }

    let cmd = IpcControlCmd::try_from(cmd)?;
    debug!(
        "[sys_semctl] semid = {}, semnum = {}, cmd = {:?}, arg = {:?}",
        semid, semnum, cmd, arg
    );

    let ns = ctx.ipc_ns;
    let semnum = semnum as usize;
    match cmd {
        IpcControlCmd::IPC_RMID => {
            remove_sem_set(ns, semid, ctx.credentials)?;
        }
        IpcControlCmd::IPC_SET => {
            let SemunArg::Ds(semid_ds) = arg else {
                return_errno_with_message!(Errno::EFAULT, "IPC_SET needs a semid_ds");
            };
            let sem_set = ns.sem_ids().get(semid)?;
            let perm = &semid_ds.sem_perm;
            sem_set.set_permission(ctx.credentials, perm.uid, perm.gid, perm.mode)?;
            sem_set.payload().update_ctime(ns);
        }
        IpcControlCmd::IPC_STAT => {
            let SemunArg::Ds(semid_ds) = arg else {
                return_errno_with_message!(Errno::EFAULT, "IPC_STAT needs a semid_ds");
            };
            let sem_set = ns.sem_ids().get(semid)?;
            sem_set.check_access(ctx.credentials, PermissionMode::READ)?;
            *semid_ds = sem_set.payload().stat(&sem_set.permission());
        }
        IpcControlCmd::SEM_SETVAL => {
            let SemunArg::Val(val) = arg else {
                return_errno_with_message!(Errno::EFAULT, "SETVAL needs a value");
            };
            check_and_ctl(semid, PermissionMode::ALTER, ctx, |sem_set| {
                sem_set.setval(semid, semnum, val, ctx.pid, ns)
            })?;
        }
        IpcControlCmd::SEM_SETALL => {
            let SemunArg::Array(vals) = arg else {
                return_errno_with_message!(Errno::EFAULT, "SETALL needs an array");
            };
            check_and_ctl(semid, PermissionMode::ALTER, ctx, |sem_set| {
                let vals = vals
                    .get(..sem_set.nsems())
                    .ok_or(Error::new(Errno::EFAULT))?;
                sem_set.setall(semid, vals, ctx.pid, ns)
            })?;
        }
        IpcControlCmd::SEM_SETCLAIM => {
            let SemunArg::Array(claim) = arg else {
                return_errno_with_message!(Errno::EFAULT, "SEM_SETCLAIM needs an array");
            };
            check_and_ctl(semid, PermissionMode::ALTER, ctx, |sem_set| {
                let claim = claim
                    .get(..sem_set.nsems())
                    .ok_or(Error::new(Errno::EFAULT))?;
                sem_set.set_claim(semid, claim, ctx.pid, ns)
            })?;
        }
        IpcControlCmd::SEM_GETALL => {
            let SemunArg::Array(vals) = arg else {
                return_errno_with_message!(Errno::EFAULT, "GETALL needs an array");
            };
            let all = check_and_ctl(semid, PermissionMode::READ, ctx, SemaphoreSet::get_all)?;
            vals.get_mut(..all.len())
                .ok_or(Error::new(Errno::EFAULT))?
                .copy_from_slice(&all);
        }
        IpcControlCmd::SEM_GETVAL => {
            let val = check_and_ctl(semid, PermissionMode::READ, ctx, |sem_set| {
                sem_set.get(semnum, |sem| sem.val())
            })?;

            return Ok(SyscallReturn::Return(val as isize));
        }
        IpcControlCmd::SEM_GETPID => {
            let pid = check_and_ctl(semid, PermissionMode::READ, ctx, |sem_set| {
                sem_set.get(semnum, |sem| sem.latest_modified_pid())
            })?;

            return Ok(SyscallReturn::Return(pid as isize));
        }
        IpcControlCmd::SEM_GETZCNT => {
            let cnt = check_and_ctl(semid, PermissionMode::READ, ctx, |sem_set| {
                sem_set.pending_const_count(semnum)
            })?;

            return Ok(SyscallReturn::Return(cnt as isize));
        }
        IpcControlCmd::SEM_GETNCNT => {
            let cnt = check_and_ctl(semid, PermissionMode::READ, ctx, |sem_set| {
                sem_set.pending_alter_count(semnum)
            })?;

            return Ok(SyscallReturn::Return(cnt as isize));
        }
        IpcControlCmd::IPC_INFO => {
            return_errno_with_message!(Errno::EINVAL, "IPC_INFO is not supported");
        }
    }

    Ok(SyscallReturn::Return(0))
}

fn check_and_ctl<T, F>(
    semid: i32,
    permission: PermissionMode,
    ctx: &Context,
    ctl_func: F,
) -> Result<T>
where
    F: FnOnce(&SemaphoreSet) -> Result<T>,
{
    let sem_set = ctx.ipc_ns.sem_ids().get(semid)?;
    sem_set.check_access(ctx.credentials, permission)?;
    ctl_func(sem_set.payload())
}
