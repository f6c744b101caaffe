// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicU64, Ordering};

use banker::Units;

use super::{
    SemidDs,
    sem::{
        BlockKind, Outcome, PendingOp, SemBuf, SemFlags, SemOpContext, Semaphore, Status,
        UpdateResult, perform_atomic_semop, remove_pending, update_pending,
    },
};
use crate::{
    ipc::{IpcFlags, IpcNamespace, IpcPermission, key_t},
    prelude::*,
    sched::WaitReason,
    sync::Waiter,
};

#[derive(Debug)]
pub struct SemaphoreSet {
    /// Number of semaphores in the set
    nsems: usize,
    /// Inner
    inner: SpinLock<SemSetInner>,
    /// The deadlock-avoidance classes of the semaphores, empty if avoidance is bypassed.
    classes: Box<[usize]>,
    /// Creation time or last modification via `semctl`
    sem_ctime: AtomicU64,
    /// Last semop time.
    sem_otime: AtomicU64,
}

pub(super) struct SemSetInner {
    /// Semaphores
    pub(super) sems: Box<[Semaphore]>,
    /// Pending alter operations.
    pub(super) pending_alter: VecDeque<PendingOp>,
    /// Pending zeros operations.
    pub(super) pending_const: VecDeque<PendingOp>,
    /// Adjustments to apply when a task exits, for the operations with `SEM_UNDO`.
    pub(super) undo: BTreeMap<Pid, Box<[i32]>>,
    /// Whether the set has been removed from the namespace.
    pub(super) removed: bool,
}

impl Debug for SemSetInner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SemSetInner")
            .field("sems", &self.sems)
            .field("pending_alter", &self.pending_alter.len())
            .field("pending_const", &self.pending_const.len())
            .field("removed", &self.removed)
            .finish()
    }
}

impl SemSetInner {
    fn count_blocked(&self, sem_num: usize, kind_matches: impl Fn(BlockKind) -> bool) -> usize {
        self.pending_alter
            .iter()
            .chain(self.pending_const.iter())
            .filter(|pending_op| {
                let blocked_on = pending_op.blocked_on();
                blocked_on.sem_num == sem_num && kind_matches(blocked_on.kind)
            })
            .count()
    }
}

impl SemaphoreSet {
    fn new(nsems: usize, ns: &IpcNamespace) -> Self {
        let now = ns.services().now_secs();
        Self {
            nsems,
            inner: SpinLock::new(SemSetInner {
                sems: vec![Semaphore::new(0); nsems].into_boxed_slice(),
                pending_alter: VecDeque::new(),
                pending_const: VecDeque::new(),
                undo: BTreeMap::new(),
                removed: false,
            }),
            classes: ns.avoidance().register_classes(nsems),
            sem_ctime: AtomicU64::new(now),
            sem_otime: AtomicU64::new(0),
        }
    }

    pub fn nsems(&self) -> usize {
        self.nsems
    }

    /// Returns the deadlock-avoidance class of each semaphore.
    pub fn classes(&self) -> &[usize] {
        &self.classes
    }

    /// Performs the operation list `sops` atomically on behalf of `pid`.
    ///
    /// If the list cannot be performed now, the caller sleeps until another task performs it
    /// on its behalf, unless an operation carries `IPC_NOWAIT`.
    pub fn semop(&self, semid: i32, sops: &[SemBuf], pid: Pid, ns: &IpcNamespace) -> Result<()> {
        if sops
            .iter()
            .any(|sop| sop.sem_num() as usize >= self.nsems)
        {
            return_errno_with_message!(Errno::EFBIG, "the semaphore index is out of range");
        }
        let alter = sops.iter().any(|sop| sop.sem_op() != 0);
        let nowait = sops
            .iter()
            .any(|sop| sop.flags().contains(SemFlags::IPC_NOWAIT));

        let mut inner = self.inner.lock();
        if inner.removed {
            return_errno_with_message!(Errno::EIDRM, "the semaphore set is removed");
        }

        let ctx = self.op_context(semid, ns);
        let SemSetInner { sems, undo, .. } = &mut *inner;
        let outcome = perform_atomic_semop(sems, undo, sops, pid, &ctx);
        let blocked_on = match outcome {
            Outcome::Done { released } => {
                self.update_otime(ns);
                let released = if alter {
                    self.update_and_wake(semid, inner, ns).released || released
                } else {
                    drop(inner);
                    released
                };
                if released {
                    retry_unsafe_blocked(ns);
                }
                return Ok(());
            }
            Outcome::Failed(err) => return Err(err),
            Outcome::Blocked(blocked_on) => blocked_on,
        };

        if nowait {
            return_errno_with_message!(Errno::EAGAIN, "the operations would block");
        }

        let (waiter, waker) = Waiter::new_pair(&ns.services().scheduler);
        let (pending_op, status) = PendingOp::new(sops.into(), pid, waker.clone(), blocked_on);
        if alter {
            inner.pending_alter.push_back(pending_op);
        } else {
            inner.pending_const.push_back(pending_op);
        }
        let _sleeper = ns.register_sleeper(waker.clone());
        drop(inner);

        loop {
            waiter.wait(WaitReason::Semaphore);

            let mut inner = self.inner.lock();
            match *status.lock() {
                Status::Pending => {}
                Status::Done => return Ok(()),
                Status::Failed(errno) => return Err(Error::new(errno)),
                Status::Removed => {
                    return_errno_with_message!(Errno::EIDRM, "the semaphore set is removed")
                }
            }

            if waker.is_interrupted() {
                inner
                    .pending_alter
                    .retain(|pending_op| !pending_op.reports_to(&status));
                inner
                    .pending_const
                    .retain(|pending_op| !pending_op.reports_to(&status));
                return_errno_with_message!(Errno::EINTR, "the wait is interrupted");
            }
        }
    }

    pub fn setval(
        &self,
        semid: i32,
        sem_num: usize,
        val: i32,
        pid: Pid,
        ns: &IpcNamespace,
    ) -> Result<()> {
        if !(0..=ns.config().sem.semvmx).contains(&val) {
            return_errno!(Errno::ERANGE);
        }

        let mut inner = self.lock_live()?;
        let sem = inner
            .sems
            .get_mut(sem_num)
            .ok_or(Error::new(Errno::EINVAL))?;
        sem.set_val(val);
        sem.set_latest_modified_pid(pid);
        for adjustments in inner.undo.values_mut() {
            adjustments[sem_num] = 0;
        }
        if let Some(&class) = self.classes.get(sem_num) {
            ns.avoidance().sync_value(class, val);
        }

        self.update_ctime(ns);
        self.update_and_wake(semid, inner, ns);
        retry_unsafe_blocked(ns);
        Ok(())
    }

    pub fn setall(&self, semid: i32, vals: &[u16], pid: Pid, ns: &IpcNamespace) -> Result<()> {
        if vals.len() != self.nsems {
            return_errno_with_message!(Errno::EINVAL, "the number of values does not match");
        }
        if vals
            .iter()
            .any(|&val| val as i32 > ns.config().sem.semvmx)
        {
            return_errno!(Errno::ERANGE);
        }

        let mut inner = self.lock_live()?;
        for (sem, &val) in inner.sems.iter_mut().zip(vals) {
            sem.set_val(val as i32);
            sem.set_latest_modified_pid(pid);
        }
        inner.undo.clear();
        for (&class, &val) in self.classes.iter().zip(vals) {
            ns.avoidance().sync_value(class, val as i32);
        }

        self.update_ctime(ns);
        self.update_and_wake(semid, inner, ns);
        retry_unsafe_blocked(ns);
        Ok(())
    }

    pub fn get<T>(&self, sem_num: usize, func: impl FnOnce(&Semaphore) -> T) -> Result<T> {
        let inner = self.lock_live()?;
        Ok(func(
            inner.sems.get(sem_num).ok_or(Error::new(Errno::EINVAL))?,
        ))
    }

    pub fn get_all(&self) -> Result<Vec<u16>> {
        let inner = self.lock_live()?;
        Ok(inner.sems.iter().map(|sem| sem.val() as u16).collect())
    }

    /// Returns the number of tasks waiting for the semaphore to increase.
    pub fn pending_alter_count(&self, sem_num: usize) -> Result<usize> {
        let inner = self.lock_live()?;
        if sem_num >= self.nsems {
            return_errno!(Errno::EINVAL);
        }
        Ok(inner.count_blocked(sem_num, |kind| kind != BlockKind::Zero))
    }

    /// Returns the number of tasks waiting for the semaphore to become zero.
    pub fn pending_const_count(&self, sem_num: usize) -> Result<usize> {
        let inner = self.lock_live()?;
        if sem_num >= self.nsems {
            return_errno!(Errno::EINVAL);
        }
        Ok(inner.count_blocked(sem_num, |kind| kind == BlockKind::Zero))
    }

    /// Declares the maximum number of units `pid` may hold on each semaphore.
    pub fn set_claim(&self, semid: i32, claim: &[u16], pid: Pid, ns: &IpcNamespace) -> Result<()> {
        if claim.len() != self.nsems {
            return_errno_with_message!(Errno::EINVAL, "the number of claims does not match");
        }

        let inner = self.lock_live()?;
        let claim: Vec<Units> = claim.iter().map(|&units| units as Units).collect();
        ns.avoidance().declare_claim(pid, &self.classes, &claim)?;

        self.update_and_wake(semid, inner, ns);
        retry_unsafe_blocked(ns);
        Ok(())
    }

    pub fn stat(&self, permission: &IpcPermission) -> SemidDs {
        SemidDs {
            sem_perm: permission.to_c(),
            sem_otime: self.sem_otime().as_secs() as i64,
            sem_ctime: self.sem_ctime().as_secs() as i64,
            sem_nsems: self.nsems as u64,
            ..Default::default()
        }
    }

    pub fn sem_ctime(&self) -> Duration {
        Duration::from_secs(self.sem_ctime.load(Ordering::Relaxed))
    }

    pub fn sem_otime(&self) -> Duration {
        Duration::from_secs(self.sem_otime.load(Ordering::Relaxed))
    }

    pub fn update_ctime(&self, ns: &IpcNamespace) {
        self.sem_ctime
            .store(ns.services().now_secs(), Ordering::Relaxed);
    }

    fn update_otime(&self, ns: &IpcNamespace) {
        self.sem_otime
            .store(ns.services().now_secs(), Ordering::Relaxed);
    }

    /// Applies the `SEM_UNDO` adjustments of an exiting task.
    pub(crate) fn exit_task(&self, semid: i32, pid: Pid, ns: &IpcNamespace) {
        let mut inner = self.inner.lock();
        if inner.removed {
            return;
        }
        let Some(adjustments) = inner.undo.remove(&pid) else {
            return;
        };

        let semvmx = ns.config().sem.semvmx;
        for (sem_num, &adjustment) in adjustments.iter().enumerate() {
            if adjustment == 0 {
                continue;
            }
            let sem = &mut inner.sems[sem_num];
            let val = (sem.val() + adjustment).clamp(0, semvmx);
            sem.set_val(val);
            sem.set_latest_modified_pid(pid);
            if let Some(&class) = self.classes.get(sem_num) {
                ns.avoidance().sync_value(class, val);
            }
        }

        self.update_and_wake(semid, inner, ns);
    }

    /// Retries the pending operations, e.g., after a release elsewhere made them safe.
    ///
    /// Returns whether some pending operation list finished.
    fn wake_pending(&self, semid: i32, ns: &IpcNamespace) -> bool {
        let inner = self.inner.lock();
        if inner.removed {
            return false;
        }
        self.update_and_wake(semid, inner, ns).finished > 0
    }

    /// Fails every pending operation and releases the avoidance classes.
    fn destroy(&self, ns: &IpcNamespace) {
        let mut wake_queue = Vec::new();

        let mut inner = self.inner.lock();
        inner.removed = true;
        remove_pending(&mut inner.pending_alter, &mut wake_queue);
        remove_pending(&mut inner.pending_const, &mut wake_queue);
        inner.undo.clear();
        drop(inner);

        ns.avoidance().unregister_classes(&self.classes);
        for waker in wake_queue {
            waker.wake_up();
        }
    }

    fn update_and_wake(
        &self,
        semid: i32,
        mut inner: SpinLockGuard<SemSetInner>,
        ns: &IpcNamespace,
    ) -> UpdateResult {
        let mut wake_queue = Vec::new();
        let result = update_pending(&mut inner, &self.op_context(semid, ns), &mut wake_queue);
        if result.finished > 0 {
            self.update_otime(ns);
        }
        // Avoid holding lock when calling `wake_up`
        drop(inner);

        for waker in wake_queue {
            waker.wake_up();
        }
        result
    }

    fn op_context<'a>(&'a self, semid: i32, ns: &'a IpcNamespace) -> SemOpContext<'a> {
        SemOpContext {
            semid,
            limits: &ns.config().sem,
            avoidance: ns.avoidance(),
            classes: &self.classes,
        }
    }

    fn lock_live(&self) -> Result<SpinLockGuard<SemSetInner>> {
        let inner = self.inner.lock();
        if inner.removed {
            return_errno_with_message!(Errno::EIDRM, "the semaphore set is removed");
        }
        Ok(inner)
    }
}

/// Returns the id of the semaphore set with `key`, creating a set of `nsems` semaphores
/// if needed.
pub fn get_or_create_sem_set(
    ns: &IpcNamespace,
    key: key_t,
    nsems: usize,
    flags: IpcFlags,
    mode: u16,
    credentials: &Credentials,
) -> Result<i32> {
    if nsems > ns.config().sem.semmsl {
        return_errno_with_message!(Errno::EINVAL, "nsems is larger than SEMMSL");
    }

    ns.sem_ids().get_or_create(
        key,
        flags,
        mode,
        credentials,
        |sem_set| {
            if nsems > sem_set.payload().nsems() {
                return_errno_with_message!(Errno::EINVAL, "the set has fewer semaphores");
            }
            Ok(())
        },
        |_| {
            if nsems == 0 {
                return_errno_with_message!(Errno::EINVAL, "a semaphore set cannot be empty");
            }
            Ok(SemaphoreSet::new(nsems, ns))
        },
    )
}

/// Removes the semaphore set `semid`. Its sleepers fail with `EIDRM`.
pub fn remove_sem_set(ns: &IpcNamespace, semid: i32, credentials: &Credentials) -> Result<()> {
    let sem_set = ns.sem_ids().remove(semid, credentials)?;
    sem_set.payload().destroy(ns);
    retry_unsafe_blocked(ns);
    Ok(())
}

/// Retries the sets that have operations refused as unsafe, after the avoidance state
/// changed in their favor.
pub fn retry_unsafe_blocked(ns: &IpcNamespace) {
    loop {
        let semids = ns.avoidance().take_unsafe_blocked();
        if semids.is_empty() {
            return;
        }

        let mut progressed = false;
        for semid in semids {
            if let Ok(sem_set) = ns.sem_ids().get(semid) {
                progressed |= sem_set.payload().wake_pending(semid, ns);
            }
        }
        if !progressed {
            return;
        }
    }
}
