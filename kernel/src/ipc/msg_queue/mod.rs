// SPDX-License-Identifier: MPL-2.0

//! System V message queues.
//!
//! A sent message goes straight to the oldest blocked receiver that wants it, if any.
//! Senders that do not fit are admitted strictly in arrival order as space frees up;
//! a blocked sender keeps its message until then.

pub mod msg;

pub use self::msg::{Message, MsgFilter, MsgFlags};
use crate::{
    ipc::{IpcFlags, IpcNamespace, IpcPerm, IpcPermission, key_t},
    prelude::*,
    process::CapSet,
    sched::WaitReason,
    sync::{Waiter, Waker},
};

/// Message queue data structure, as in `struct msqid_ds`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct MsqidDs {
    /// Operation permissions
    pub msg_perm: IpcPerm,
    /// Last msgsnd time
    pub msg_stime: i64,
    /// Last msgrcv time
    pub msg_rtime: i64,
    /// Last change time
    pub msg_ctime: i64,
    /// Number of bytes in the queue
    pub msg_cbytes: u64,
    /// Number of messages in the queue
    pub msg_qnum: u64,
    /// Maximum number of bytes in the queue
    pub msg_qbytes: u64,
    /// PID of last msgsnd
    pub msg_lspid: i32,
    /// PID of last msgrcv
    pub msg_lrpid: i32,
    /// Reserved for future use
    pub _unused4: u64,
    /// Reserved for future use
    pub _unused5: u64,
}

enum RecvStatus {
    Pending,
    Received(Message),
    Failed(Errno),
    Removed,
}

enum SendStatus {
    Pending,
    Done,
    Removed,
}

struct PendingReceiver {
    filter: MsgFilter,
    max_size: usize,
    no_error: bool,
    pid: Pid,
    waker: Arc<Waker>,
    status: Arc<SpinLock<RecvStatus>>,
}

struct PendingSender {
    message: Message,
    pid: Pid,
    waker: Arc<Waker>,
    status: Arc<SpinLock<SendStatus>>,
}

struct QueueInner {
    messages: VecDeque<Message>,
    /// Number of bytes in the queue
    cbytes: usize,
    /// Maximum number of bytes in the queue
    qbytes: usize,
    receivers: VecDeque<PendingReceiver>,
    senders: VecDeque<PendingSender>,
    stime: u64,
    rtime: u64,
    ctime: u64,
    lspid: Pid,
    lrpid: Pid,
    removed: bool,
}

impl QueueInner {
    fn has_room(&self, len: usize) -> bool {
        self.cbytes + len <= self.qbytes && self.messages.len() < self.qbytes
    }

    /// Hands `message` to a blocked receiver or appends it to the queue.
    fn deliver(&mut self, mut message: Message, wake_queue: &mut Vec<Arc<Waker>>) {
        let mut index = 0;
        while index < self.receivers.len() {
            let receiver = &self.receivers[index];
            if receiver.waker.is_interrupted() || !receiver.filter.matches(message.mtype()) {
                index += 1;
                continue;
            }

            let Some(receiver) = self.receivers.remove(index) else {
                break;
            };
            if message.len() > receiver.max_size {
                if !receiver.no_error {
                    *receiver.status.lock() = RecvStatus::Failed(Errno::E2BIG);
                    wake_queue.push(receiver.waker);
                    continue;
                }
                message.truncate(receiver.max_size);
            }

            self.lrpid = receiver.pid;
            *receiver.status.lock() = RecvStatus::Received(message);
            wake_queue.push(receiver.waker);
            return;
        }

        self.cbytes += message.len();
        self.messages.push_back(message);
    }

    /// Admits the blocked senders, in arrival order, while their messages fit.
    ///
    /// Interrupted senders are passed over; they withdraw by themselves.
    fn admit_senders(&mut self, now: u64, wake_queue: &mut Vec<Arc<Waker>>) {
        let mut index = 0;
        while index < self.senders.len() {
            let sender = &self.senders[index];
            if sender.waker.is_interrupted() {
                index += 1;
                continue;
            }
            if !self.has_room(sender.message.len()) {
                break;
            }

            let Some(sender) = self.senders.remove(index) else {
                break;
            };
            self.lspid = sender.pid;
            self.stime = now;
            self.deliver(sender.message, wake_queue);
            *sender.status.lock() = SendStatus::Done;
            wake_queue.push(sender.waker);
        }
    }

    fn fail_all(&mut self, wake_queue: &mut Vec<Arc<Waker>>) {
        for receiver in self.receivers.drain(..) {
            *receiver.status.lock() = RecvStatus::Removed;
            wake_queue.push(receiver.waker);
        }
        for sender in self.senders.drain(..) {
            *sender.status.lock() = SendStatus::Removed;
            wake_queue.push(sender.waker);
        }
        self.messages.clear();
        self.cbytes = 0;
    }
}

/// A message queue.
pub struct MsgQueue {
    inner: SpinLock<QueueInner>,
}

impl MsgQueue {
    fn new(qbytes: usize, now: u64) -> Self {
        Self {
            inner: SpinLock::new(QueueInner {
                messages: VecDeque::new(),
                cbytes: 0,
                qbytes,
                receivers: VecDeque::new(),
                senders: VecDeque::new(),
                stime: 0,
                rtime: 0,
                ctime: now,
                lspid: 0,
                lrpid: 0,
                removed: false,
            }),
        }
    }

    /// Sends `message` on behalf of `pid`.
    ///
    /// Blocks while the queue is full or earlier senders are still waiting, unless
    /// `nowait` is set.
    pub fn send(&self, message: Message, nowait: bool, pid: Pid, ns: &IpcNamespace) -> Result<()> {
        if message.mtype() < 1 {
            return_errno_with_message!(Errno::EINVAL, "the message type must be positive");
        }
        if message.len() > ns.config().msg.msgmax {
            return_errno_with_message!(Errno::EINVAL, "the message is larger than MSGMAX");
        }

        let now = ns.services().now_secs();
        let mut inner = self.inner.lock();
        if inner.removed {
            return_errno_with_message!(Errno::EIDRM, "the message queue is removed");
        }
        if message.len() > inner.qbytes {
            return_errno_with_message!(Errno::EINVAL, "the message is larger than the queue");
        }

        let waiting_senders = inner
            .senders
            .iter()
            .any(|sender| !sender.waker.is_interrupted());
        if !waiting_senders && inner.has_room(message.len()) {
            let mut wake_queue = Vec::new();
            inner.lspid = pid;
            inner.stime = now;
            inner.deliver(message, &mut wake_queue);
            drop(inner);

            for waker in wake_queue {
                waker.wake_up();
            }
            return Ok(());
        }

        if nowait {
            return_errno_with_message!(Errno::EAGAIN, "the message queue is full");
        }

        let (waiter, waker) = Waiter::new_pair(&ns.services().scheduler);
        let status = Arc::new(SpinLock::new(SendStatus::Pending));
        inner.senders.push_back(PendingSender {
            message,
            pid,
            waker: waker.clone(),
            status: status.clone(),
        });
        let _sleeper = ns.register_sleeper(waker.clone());
        drop(inner);

        loop {
            waiter.wait(WaitReason::MsgSend);

            let mut inner = self.inner.lock();
            match *status.lock() {
                SendStatus::Pending => {}
                SendStatus::Done => return Ok(()),
                SendStatus::Removed => {
                    return_errno_with_message!(Errno::EIDRM, "the message queue is removed")
                }
            }

            if waker.is_interrupted() {
                inner
                    .senders
                    .retain(|sender| !Arc::ptr_eq(&sender.status, &status));
                // Withdrawing may let the senders behind in.
                let mut wake_queue = Vec::new();
                inner.admit_senders(now, &mut wake_queue);
                drop(inner);
                for waker in wake_queue {
                    waker.wake_up();
                }
                return_errno_with_message!(Errno::EINTR, "the wait is interrupted");
            }
        }
    }

    /// Receives a message that matches `filter` on behalf of `pid`.
    ///
    /// A message longer than `max_size` fails with `E2BIG` and stays in the queue, unless
    /// `MSG_NOERROR` is set, in which case it is truncated.
    pub fn receive(
        &self,
        filter: MsgFilter,
        max_size: usize,
        flags: MsgFlags,
        pid: Pid,
        ns: &IpcNamespace,
    ) -> Result<Message> {
        let no_error = flags.contains(MsgFlags::MSG_NOERROR);
        let now = ns.services().now_secs();

        let mut inner = self.inner.lock();
        if inner.removed {
            return_errno_with_message!(Errno::EIDRM, "the message queue is removed");
        }

        if let Some(index) = filter.select(inner.messages.iter()) {
            if inner.messages[index].len() > max_size && !no_error {
                return_errno_with_message!(Errno::E2BIG, "the message is larger than the buffer");
            }
            let Some(mut message) = inner.messages.remove(index) else {
                unreachable!("the selected message is out of range");
            };
            inner.cbytes -= message.len();
            message.truncate(max_size);
            inner.lrpid = pid;
            inner.rtime = now;

            let mut wake_queue = Vec::new();
            inner.admit_senders(now, &mut wake_queue);
            drop(inner);
            for waker in wake_queue {
                waker.wake_up();
            }
            return Ok(message);
        }

        if flags.contains(MsgFlags::IPC_NOWAIT) {
            return_errno_with_message!(Errno::ENOMSG, "no message of the desired type");
        }

        let (waiter, waker) = Waiter::new_pair(&ns.services().scheduler);
        let status = Arc::new(SpinLock::new(RecvStatus::Pending));
        inner.receivers.push_back(PendingReceiver {
            filter,
            max_size,
            no_error,
            pid,
            waker: waker.clone(),
            status: status.clone(),
        });
        let _sleeper = ns.register_sleeper(waker.clone());
        drop(inner);

        loop {
            waiter.wait(WaitReason::MsgReceive);

            let mut inner = self.inner.lock();
            let mut status_guard = status.lock();
            match core::mem::replace(&mut *status_guard, RecvStatus::Pending) {
                RecvStatus::Pending => {}
                RecvStatus::Received(message) => {
                    inner.rtime = ns.services().now_secs();
                    return Ok(message);
                }
                RecvStatus::Failed(errno) => return Err(Error::new(errno)),
                RecvStatus::Removed => {
                    return_errno_with_message!(Errno::EIDRM, "the message queue is removed")
                }
            }
            drop(status_guard);

            if waker.is_interrupted() {
                inner
                    .receivers
                    .retain(|receiver| !Arc::ptr_eq(&receiver.status, &status));
                return_errno_with_message!(Errno::EINTR, "the wait is interrupted");
            }
        }
    }

    /// Returns the status of the queue, as `IPC_STAT` does.
    pub fn stat(&self, permission: &IpcPermission) -> MsqidDs {
        let inner = self.inner.lock();
        MsqidDs {
            msg_perm: permission.to_c(),
            msg_stime: inner.stime as i64,
            msg_rtime: inner.rtime as i64,
            msg_ctime: inner.ctime as i64,
            msg_cbytes: inner.cbytes as u64,
            msg_qnum: inner.messages.len() as u64,
            msg_qbytes: inner.qbytes as u64,
            msg_lspid: inner.lspid as i32,
            msg_lrpid: inner.lrpid as i32,
            ..Default::default()
        }
    }

    /// Returns the number of messages in the queue.
    pub fn qnum(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn cbytes(&self) -> usize {
        self.inner.lock().cbytes
    }

    pub fn qbytes(&self) -> usize {
        self.inner.lock().qbytes
    }

    /// Returns the numbers of blocked senders and receivers.
    pub fn nr_waiting(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.senders.len(), inner.receivers.len())
    }

    fn set_qbytes(&self, qbytes: usize, now: u64) {
        let mut wake_queue = Vec::new();
        let mut inner = self.inner.lock();
        inner.qbytes = qbytes;
        inner.ctime = now;
        inner.admit_senders(now, &mut wake_queue);
        drop(inner);

        for waker in wake_queue {
            waker.wake_up();
        }
    }

    fn destroy(&self) {
        let mut wake_queue = Vec::new();
        let mut inner = self.inner.lock();
        inner.removed = true;
        inner.fail_all(&mut wake_queue);
        drop(inner);

        for waker in wake_queue {
            waker.wake_up();
        }
    }
}

impl Debug for MsgQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MsgQueue")
            .field("qnum", &inner.messages.len())
            .field("cbytes", &inner.cbytes)
            .field("qbytes", &inner.qbytes)
            .field("senders", &inner.senders.len())
            .field("receivers", &inner.receivers.len())
            .field("removed", &inner.removed)
            .finish()
    }
}

/// Returns the id of the message queue with `key`, creating it if needed.
pub fn get_or_create_msg_queue(
    ns: &IpcNamespace,
    key: key_t,
    flags: IpcFlags,
    mode: u16,
    credentials: &Credentials,
) -> Result<i32> {
    ns.msg_ids().get_or_create(
        key,
        flags,
        mode,
        credentials,
        |_| Ok(()),
        |_| Ok(MsgQueue::new(ns.config().msg.msgmnb, ns.services().now_secs())),
    )
}

/// Changes the owner, the mode and the capacity of the queue `msqid`, as `IPC_SET` does.
///
/// Raising the capacity above `MSGMNB` requires `CAP_SYS_RESOURCE`.
pub fn set_msg_queue(
    ns: &IpcNamespace,
    msqid: i32,
    msqid_ds: &MsqidDs,
    credentials: &Credentials,
) -> Result<()> {
    let msg_queue = ns.msg_ids().get(msqid)?;
    msg_queue.check_owner(credentials)?;

    let qbytes = msqid_ds.msg_qbytes as usize;
    if qbytes > ns.config().msg.msgmnb && !credentials.capable(CapSet::SYS_RESOURCE) {
        return_errno_with_message!(Errno::EPERM, "raising the capacity needs CAP_SYS_RESOURCE");
    }

    let perm = &msqid_ds.msg_perm;
    msg_queue.set_permission(credentials, perm.uid, perm.gid, perm.mode)?;
    msg_queue
        .payload()
        .set_qbytes(qbytes, ns.services().now_secs());
    Ok(())
}

/// Removes the queue `msqid`. Its blocked senders and receivers fail with `EIDRM`.
pub fn remove_msg_queue(ns: &IpcNamespace, msqid: i32, credentials: &Credentials) -> Result<()> {
    let msg_queue = ns.msg_ids().remove(msqid, credentials)?;
    msg_queue.payload().destroy();
    Ok(())
}
