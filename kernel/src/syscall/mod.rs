// SPDX-License-Identifier: MPL-2.0

//! The System V IPC system calls.
//!
//! Each handler decodes its arguments, checks the permission of the caller and calls into
//! the IPC managers. Copying from and to the user space is left to the embedding kernel;
//! the handlers take the user buffers as typed values.

mod msgctl;
mod msgget;
mod msgrcv;
mod msgsnd;
mod semctl;
mod semget;
mod semop;
mod shmat;
mod shmctl;
mod shmdt;
mod shmget;

pub use self::{
    msgctl::sys_msgctl,
    msgget::sys_msgget,
    msgrcv::sys_msgrcv,
    msgsnd::sys_msgsnd,
    semctl::{SemunArg, sys_semctl},
    semget::sys_semget,
    semop::sys_semop,
    shmat::sys_shmat,
    shmctl::sys_shmctl,
    shmdt::sys_shmdt,
    shmget::sys_shmget,
};
use crate::{
    ipc::{IpcFlags, IpcNamespace},
    prelude::*,
    vm::AddressSpace,
};

/// The calling task, as seen by the IPC system calls.
pub struct Context<'a> {
    pub ipc_ns: &'a IpcNamespace,
    pub pid: Pid,
    pub credentials: &'a Credentials,
    pub vm: &'a Arc<dyn AddressSpace>,
}

/// Syscall return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallReturn {
    /// return isize, this value will be used to set rax
    Return(isize),
    /// does not need to set rax
    NoReturn,
}

/// Converts the result of a handler into the raw return value: the value itself, or the
/// negated error number.
pub fn raw_return(result: Result<SyscallReturn>) -> isize {
    match result {
        Ok(SyscallReturn::Return(value)) => value,
        Ok(SyscallReturn::NoReturn) => 0,
        Err(err) => {
            debug!("syscall return error: {:?}", err);
            -(err.error() as i32 as isize)
        }
    }
}

/// Splits the `*flg` argument of the `*get` calls into the IPC flags and the access mode.
fn decode_get_flags(flags: i32) -> (IpcFlags, u16) {
    let flags = flags as u32;
    (IpcFlags::from_bits_truncate(flags), (flags & 0o777) as u16)
}

fn check_id(id: i32) -> Result<()> {
    if id < 0 {
        return_errno_with_message!(Errno::EINVAL, "negative IPC id");
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ipc::{
            IPC_PRIVATE,
            msg_queue::MsqidDs,
            semaphore::system_v::{SemBuf, SemFlags, SemidDs},
        },
        process::{Gid, Uid},
        test_util::TestEnv,
        vm::shared_mem::ShmidDs,
    };

    const IPC_CREAT: i32 = 0o1000;
    const IPC_EXCL: i32 = 0o2000;
    const IPC_NOWAIT: i32 = 0o4000;

    fn ret(result: Result<SyscallReturn>) -> isize {
        raw_return(result)
    }

    #[test]
    fn raw_returns() {
        assert_eq!(raw_return(Ok(SyscallReturn::Return(7))), 7);
        assert_eq!(raw_return(Ok(SyscallReturn::NoReturn)), 0);
        assert_eq!(raw_return(Err(Error::new(Errno::EIDRM))), -43);
    }

    #[test]
    fn semaphore_calls() {
        let env = TestEnv::new();
        let owner = env.task(1);
        let ctx = owner.ctx();

        let semid = ret(sys_semget(99, 2, IPC_CREAT | 0o600, &ctx)) as i32;
        assert!(semid >= 0);
        assert_eq!(ret(sys_semget(99, 2, IPC_CREAT | IPC_EXCL | 0o600, &ctx)), -17);
        assert_eq!(ret(sys_semget(98, 2, 0o600, &ctx)), -2);

        let mut vals = [3u16, 5];
        assert_eq!(ret(sys_semctl(semid, 0, 17, SemunArg::Array(&mut vals), &ctx)), 0);
        let sops = [SemBuf::new(1, -2, SemFlags::empty())];
        assert_eq!(ret(sys_semop(semid, &sops, &ctx)), 0);
        assert_eq!(ret(sys_semop(semid, &[], &ctx)), -22);

        let mut all = [0u16; 2];
        assert_eq!(ret(sys_semctl(semid, 0, 13, SemunArg::Array(&mut all), &ctx)), 0);
        assert_eq!(all, [3, 3]);
        assert_eq!(ret(sys_semctl(semid, 1, 12, SemunArg::None, &ctx)), 3);
        assert_eq!(ret(sys_semctl(semid, 1, 11, SemunArg::None, &ctx)), 1);
        assert_eq!(ret(sys_semctl(semid, 0, 16, SemunArg::Val(8), &ctx)), 0);
        assert_eq!(ret(sys_semctl(semid, 0, 12, SemunArg::None, &ctx)), 8);
        assert_eq!(ret(sys_semctl(semid, 0, 14, SemunArg::None, &ctx)), 0);
        assert_eq!(ret(sys_semctl(semid, 0, 99, SemunArg::None, &ctx)), -22);

        let mut semid_ds = SemidDs::default();
        assert_eq!(ret(sys_semctl(semid, 0, 2, SemunArg::Ds(&mut semid_ds), &ctx)), 0);
        assert_eq!(semid_ds.sem_nsems, 2);
        assert_eq!(semid_ds.sem_perm.mode, 0o600);

        // Read-only for the group.
        semid_ds.sem_perm.mode = 0o640;
        assert_eq!(ret(sys_semctl(semid, 0, 1, SemunArg::Ds(&mut semid_ds), &ctx)), 0);
        let member = env.task_with(2, Credentials::new(Uid::new(2000), Gid::new(1000)));
        assert_eq!(ret(sys_semctl(semid, 0, 12, SemunArg::None, &member.ctx())), 8);
        assert_eq!(ret(sys_semop(semid, &sops, &member.ctx())), -13);
        assert_eq!(ret(sys_semctl(semid, 0, 0, SemunArg::None, &member.ctx())), -1);

        assert_eq!(ret(sys_semctl(semid, 0, 0, SemunArg::None, &ctx)), 0);
        assert_eq!(ret(sys_semop(semid, &sops, &ctx)), -22);
    }

    #[test]
    fn shared_memory_calls() {
        let env = TestEnv::new();
        let a = env.task(1);
        let b = env.task(2);

        let shmid = ret(sys_shmget(IPC_PRIVATE, 8192, IPC_CREAT | 0o600, &a.ctx())) as i32;
        assert!(shmid >= 0);

        let addr_a = ret(sys_shmat(shmid, 0, 0, &a.ctx())) as Vaddr;
        let addr_b = ret(sys_shmat(shmid, 0, 0, &b.ctx())) as Vaddr;
        a.space.write(addr_a + 100, b"shared").unwrap();
        let mut buf = [0; 6];
        b.space.read(addr_b + 100, &mut buf).unwrap();
        assert_eq!(&buf, b"shared");

        let mut shmid_ds = ShmidDs::default();
        assert_eq!(ret(sys_shmctl(shmid, 2, Some(&mut shmid_ds), &a.ctx())), 0);
        assert_eq!(shmid_ds.shm_segsz, 8192);
        assert_eq!(shmid_ds.shm_nattch, 2);
        assert_eq!(shmid_ds.shm_cpid, 1);
        assert_eq!(ret(sys_shmctl(shmid, 2, None, &a.ctx())), -14);

        assert_eq!(ret(sys_shmdt(addr_a + 1, &a.ctx())), -22);
        assert_eq!(ret(sys_shmdt(addr_a, &a.ctx())), 0);
        assert_eq!(ret(sys_shmctl(shmid, 0, None, &a.ctx())), 0);
        assert_eq!(env.frames.live_pages(), 2);
        assert_eq!(ret(sys_shmdt(addr_b, &b.ctx())), 0);
        assert_eq!(env.frames.live_pages(), 0);
        assert_eq!(ret(sys_shmat(shmid, 0, 0, &a.ctx())), -22);
    }

    #[test]
    fn message_queue_calls() {
        let env = TestEnv::new();
        let task = env.task(1);
        let ctx = task.ctx();

        let msqid = ret(sys_msgget(7, IPC_CREAT | 0o600, &ctx)) as i32;
        assert!(msqid >= 0);

        let mut msgbuf = Vec::new();
        msgbuf.extend_from_slice(&5i64.to_ne_bytes());
        msgbuf.extend_from_slice(b"payload");
        assert_eq!(ret(sys_msgsnd(msqid, &msgbuf, 7, 0, &ctx)), 0);
        assert_eq!(ret(sys_msgsnd(msqid, &msgbuf, 8, 0, &ctx)), -14);

        let mut msqid_ds = MsqidDs::default();
        assert_eq!(ret(sys_msgctl(msqid, 2, Some(&mut msqid_ds), &ctx)), 0);
        assert_eq!(msqid_ds.msg_qnum, 1);
        assert_eq!(msqid_ds.msg_cbytes, 7);

        let mut recvbuf = [0u8; 8 + 16];
        assert_eq!(ret(sys_msgrcv(msqid, &mut recvbuf, 16, 4, IPC_NOWAIT, &ctx)), -42);
        assert_eq!(ret(sys_msgrcv(msqid, &mut recvbuf, 4, 5, IPC_NOWAIT, &ctx)), -7);
        assert_eq!(ret(sys_msgrcv(msqid, &mut recvbuf, 16, -5, IPC_NOWAIT, &ctx)), 7);
        assert_eq!(i64::from_ne_bytes(recvbuf[..8].try_into().unwrap()), 5);
        assert_eq!(&recvbuf[8..15], b"payload");

        assert_eq!(ret(sys_msgctl(msqid, 0, None, &ctx)), 0);
        assert_eq!(ret(sys_msgsnd(msqid, &msgbuf, 7, 0, &ctx)), -22);
    }

    #[test]
    fn message_sizes_are_checked() {
        let env = TestEnv::new();
        let task = env.task(1);
        let ctx = task.ctx();
        let msqid = ret(sys_msgget(IPC_PRIVATE, IPC_CREAT | 0o600, &ctx)) as i32;

        let msgbuf = [0u8; 16];
        assert_eq!(ret(sys_msgsnd(msqid, &msgbuf, usize::MAX, 0, &ctx)), -22);
        assert_eq!(ret(sys_msgsnd(msqid, &msgbuf, 8193, 0, &ctx)), -22);
        assert_eq!(ret(sys_msgsnd(msqid, &msgbuf, usize::MAX - 7, 0, &ctx)), -22);

        let mut recvbuf = [0u8; 16];
        assert_eq!(
            ret(sys_msgrcv(msqid, &mut recvbuf, usize::MAX, 0, IPC_NOWAIT, &ctx)),
            -22
        );
        // Capped to MSGMAX, which still does not fit in the buffer.
        assert_eq!(
            ret(sys_msgrcv(msqid, &mut recvbuf, isize::MAX as usize, 0, IPC_NOWAIT, &ctx)),
            -14
        );
        assert_eq!(
            ret(sys_msgrcv(msqid, &mut recvbuf, 8, 0, IPC_NOWAIT, &ctx)),
            -42
        );
    }
}
