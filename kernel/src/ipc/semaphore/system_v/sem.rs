// SPDX-License-Identifier: MPL-2.0

//! Semaphores and the operations pending on them.

use banker::{Units, Verdict};

use super::sem_set::SemSetInner;
use crate::{config::SemLimits, ipc::avoidance::Avoidance, prelude::*, sync::Waker};

bitflags! {
    /// Flags of a [`SemBuf`].
    pub struct SemFlags: i16 {
        /// Fail instead of waiting.
        const IPC_NOWAIT = 0o4000;
        /// Undo the operation when the task exits.
        const SEM_UNDO = 0x1000;
    }
}

/// One operation on one semaphore, as in `struct sembuf`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SemBuf {
    sem_num: u16,
    sem_op: i16,
    sem_flg: i16,
}

impl SemBuf {
    pub const fn new(sem_num: u16, sem_op: i16, flags: SemFlags) -> Self {
        Self {
            sem_num,
            sem_op,
            sem_flg: flags.bits(),
        }
    }

    pub fn sem_num(&self) -> u16 {
        self.sem_num
    }

    pub fn sem_op(&self) -> i16 {
        self.sem_op
    }

    pub fn flags(&self) -> SemFlags {
        SemFlags::from_bits_truncate(self.sem_flg)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Semaphore {
    val: i32,
    /// PID of the process that last modified the semaphore.
    latest_modified_pid: Pid,
}

impl Semaphore {
    pub(super) fn new(val: i32) -> Self {
        Self {
            val,
            latest_modified_pid: 0,
        }
    }

    pub fn val(&self) -> i32 {
        self.val
    }

    pub fn latest_modified_pid(&self) -> Pid {
        self.latest_modified_pid
    }

    pub(super) fn set_val(&mut self, val: i32) {
        self.val = val;
    }

    pub(super) fn set_latest_modified_pid(&mut self, pid: Pid) {
        self.latest_modified_pid = pid;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Status {
    Pending,
    /// The operations were performed on behalf of the sleeper.
    Done,
    Failed(Errno),
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BlockKind {
    /// Waiting for the semaphore to become zero.
    Zero,
    /// Waiting for the semaphore to increase.
    Increase,
    /// The values suffice, but the decrement was refused as unsafe.
    Unsafe,
}

/// The semaphore that blocks a pending operation list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct BlockedOn {
    pub(super) sem_num: usize,
    pub(super) kind: BlockKind,
}

pub(super) struct PendingOp {
    sops: Box<[SemBuf]>,
    pid: Pid,
    status: Arc<SpinLock<Status>>,
    waker: Arc<Waker>,
    blocked_on: BlockedOn,
}

impl PendingOp {
    pub(super) fn new(
        sops: Box<[SemBuf]>,
        pid: Pid,
        waker: Arc<Waker>,
        blocked_on: BlockedOn,
    ) -> (Self, Arc<SpinLock<Status>>) {
        let status = Arc::new(SpinLock::new(Status::Pending));
        let pending_op = Self {
            sops,
            pid,
            status: status.clone(),
            waker,
            blocked_on,
        };
        (pending_op, status)
    }

    pub(super) fn blocked_on(&self) -> BlockedOn {
        self.blocked_on
    }

    /// Returns whether this operation reports to `status`.
    pub(super) fn reports_to(&self, status: &Arc<SpinLock<Status>>) -> bool {
        Arc::ptr_eq(&self.status, status)
    }

    /// Publishes the final status and queues the sleeper for waking.
    ///
    /// The caller must remove the operation from its pending list.
    pub(super) fn finish(&self, status: Status, wake_queue: &mut Vec<Arc<Waker>>) {
        *self.status.lock() = status;
        wake_queue.push(self.waker.clone());
    }
}

/// What an operation list needs besides the semaphores themselves.
pub(super) struct SemOpContext<'a> {
    pub(super) semid: i32,
    pub(super) limits: &'a SemLimits,
    pub(super) avoidance: &'a Avoidance,
    pub(super) classes: &'a [usize],
}

pub(super) enum Outcome {
    /// Performed. `released` is true if some semaphore was incremented.
    Done { released: bool },
    Blocked(BlockedOn),
    Failed(Error),
}

/// Performs `sops` of `pid` atomically, or nothing at all.
///
/// The operations are applied in order on a copy of the values. Only if every operation can
/// proceed, and the decrements are granted by the deadlock-avoidance check, the copy is
/// committed.
pub(super) fn perform_atomic_semop(
    sems: &mut [Semaphore],
    undo: &mut BTreeMap<Pid, Box<[i32]>>,
    sops: &[SemBuf],
    pid: Pid,
    ctx: &SemOpContext,
) -> Outcome {
    let nsems = sems.len();
    let mut values: Vec<i32> = sems.iter().map(Semaphore::val).collect();
    let mut adjustments: Option<Box<[i32]>> = None;

    for sop in sops {
        let sem_num = sop.sem_num() as usize;
        let val = values[sem_num];
        let sem_op = sop.sem_op() as i32;

        if sem_op == 0 {
            if val != 0 {
                return Outcome::Blocked(BlockedOn {
                    sem_num,
                    kind: BlockKind::Zero,
                });
            }
            continue;
        }

        let result = val + sem_op;
        if result < 0 {
            return Outcome::Blocked(BlockedOn {
                sem_num,
                kind: BlockKind::Increase,
            });
        }
        if result > ctx.limits.semvmx {
            return Outcome::Failed(Error::with_message(
                Errno::ERANGE,
                "the semaphore value would exceed SEMVMX",
            ));
        }

        if sop.flags().contains(SemFlags::SEM_UNDO) {
            let adjustments = adjustments.get_or_insert_with(|| {
                undo.get(&pid)
                    .cloned()
                    .unwrap_or_else(|| vec![0; nsems].into_boxed_slice())
            });
            let adjustment = adjustments[sem_num] - sem_op;
            if adjustment < -ctx.limits.semaem - 1 || adjustment > ctx.limits.semaem {
                return Outcome::Failed(Error::with_message(
                    Errno::ERANGE,
                    "the adjustment would exceed SEMAEM",
                ));
            }
            adjustments[sem_num] = adjustment;
        }

        values[sem_num] = result;
    }

    let request: Vec<(usize, Units)> = sems
        .iter()
        .zip(&values)
        .enumerate()
        .filter(|(_, (sem, value))| **value < sem.val())
        .map(|(sem_num, (sem, value))| (sem_num, (sem.val() - value) as Units))
        .collect();
    if let Some(&(first, _)) = request.first() {
        match ctx.avoidance.acquire(ctx.semid, pid, ctx.classes, &request) {
            Ok(Verdict::Safe) => {}
            Ok(Verdict::Wait | Verdict::WaitUnsafe) => {
                return Outcome::Blocked(BlockedOn {
                    sem_num: first,
                    kind: BlockKind::Unsafe,
                });
            }
            Ok(Verdict::Error) => {
                return Outcome::Failed(Error::with_message(
                    Errno::EINVAL,
                    "the request exceeds the declared claim",
                ));
            }
            Err(err) => return Outcome::Failed(err),
        }
    }

    for sop in sops {
        sems[sop.sem_num() as usize].set_latest_modified_pid(pid);
    }
    let mut released = false;
    for (sem_num, (sem, &value)) in sems.iter_mut().zip(&values).enumerate() {
        if value > sem.val() {
            released = true;
            if let Some(&class) = ctx.classes.get(sem_num) {
                let units = (value - sem.val()) as Units;
                if let Err(err) = ctx.avoidance.release(pid, class, units) {
                    warn!("[semop] failed to release semaphore {}: {}", sem_num, err);
                }
            }
        }
        sem.set_val(value);
    }
    if let Some(adjustments) = adjustments {
        undo.insert(pid, adjustments);
    }

    Outcome::Done { released }
}

#[derive(Debug, Default)]
pub(super) struct UpdateResult {
    /// The number of pending operation lists that completed or failed.
    pub(super) finished: usize,
    /// Whether some semaphore was incremented.
    pub(super) released: bool,
}

/// Retries the pending operations after the values of the set changed.
///
/// Altering operations are retried in arrival order; after each one that completes, the
/// scan restarts from the oldest. Wait-for-zero operations are retried afterwards.
pub(super) fn update_pending(
    inner: &mut SemSetInner,
    ctx: &SemOpContext,
    wake_queue: &mut Vec<Arc<Waker>>,
) -> UpdateResult {
    let mut result = UpdateResult::default();

    'restart: loop {
        for index in 0..inner.pending_alter.len() {
            let pending_op = &inner.pending_alter[index];
            // An interrupted sleeper withdraws its operations by itself.
            if pending_op.waker.is_interrupted() {
                continue;
            }

            let status = match perform_atomic_semop(
                &mut inner.sems,
                &mut inner.undo,
                &pending_op.sops,
                pending_op.pid,
                ctx,
            ) {
                Outcome::Blocked(blocked_on) => {
                    inner.pending_alter[index].blocked_on = blocked_on;
                    continue;
                }
                Outcome::Done { released } => {
                    result.released |= released;
                    Status::Done
                }
                Outcome::Failed(err) => Status::Failed(err.error()),
            };

            if let Some(pending_op) = inner.pending_alter.remove(index) {
                pending_op.finish(status, wake_queue);
                result.finished += 1;
            }
            continue 'restart;
        }
        break;
    }

    let SemSetInner {
        sems,
        undo,
        pending_const,
        ..
    } = inner;
    pending_const.retain_mut(|pending_op| {
        if pending_op.waker.is_interrupted() {
            return true;
        }
        let status = match perform_atomic_semop(sems, undo, &pending_op.sops, pending_op.pid, ctx)
        {
            Outcome::Blocked(blocked_on) => {
                pending_op.blocked_on = blocked_on;
                return true;
            }
            Outcome::Done { .. } => Status::Done,
            Outcome::Failed(err) => Status::Failed(err.error()),
        };
        pending_op.finish(status, wake_queue);
        result.finished += 1;
        false
    });

    result
}

/// Fails every pending operation because the set is removed.
pub(super) fn remove_pending(pending: &mut VecDeque<PendingOp>, wake_queue: &mut Vec<Arc<Waker>>) {
    for pending_op in pending.drain(..) {
        pending_op.finish(Status::Removed, wake_queue);
    }
}
