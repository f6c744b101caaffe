// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    prelude::*,
    sched::{Scheduler, WaitReason},
};

// # Explanation on the memory orders
//
// ```
// [CPU 1 (the waker)]     [CPU 2 (the waiter)]
// status = Done;
// wake_up();
//                         wait();
//                         if status == Done { /* .. */ }
// ```
//
// The IPC objects update the status of a pending operation under the object lock, and the
// waiter reads it under the same lock, so the status itself is always synchronized. The
// `has_woken` flag still uses `Release` in `wake_up()` and `Acquire` in `wait()` so that a
// waiter returning from `wait()` observes the interruption mark set before the wake-up.

/// A waiter that can put the current task to sleep until it is woken up by the associated
/// [`Waker`].
///
/// A waiter belongs to the task that created it.
pub struct Waiter {
    waker: Arc<Waker>,
}

/// A waker that can wake up the associated [`Waiter`].
///
/// A waker can be created by calling [`Waiter::new_pair`]. The `Arc<Waker>` can be stored in the
/// wait lists of IPC objects and used from any task.
pub struct Waker {
    has_woken: AtomicBool,
    interrupted: AtomicBool,
    pid: Pid,
    scheduler: Arc<dyn Scheduler>,
}

impl Waiter {
    /// Creates a waiter for the current task and its associated [`Waker`].
    pub fn new_pair(scheduler: &Arc<dyn Scheduler>) -> (Self, Arc<Waker>) {
        let waker = Arc::new(Waker {
            has_woken: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            pid: scheduler.current_task_id(),
            scheduler: scheduler.clone(),
        });
        let waiter = Self {
            waker: waker.clone(),
        };
        (waiter, waker)
    }

    /// Waits until the waiter is woken up by calling [`Waker::wake_up`] or
    /// [`Waker::interrupt`] on the associated [`Waker`].
    ///
    /// This method returns immediately if the waiter has been woken since the end of the last
    /// call to this method (or since the waiter was created, if this method has not been called
    /// before). Otherwise, it puts the current task to sleep until the waiter is woken up.
    pub fn wait(&self, reason: WaitReason) {
        self.waker.do_wait(reason);
    }
}

impl Waker {
    /// Wakes up the associated [`Waiter`].
    ///
    /// This method returns `true` if the waiter is woken by this call. It returns `false` if
    /// the waiter has already been woken by a previous call and has not waited since.
    pub fn wake_up(&self) -> bool {
        if self.has_woken.swap(true, Ordering::Release) {
            return false;
        }
        self.scheduler.wake_task(self.pid);

        true
    }

    /// Marks the wait as interrupted and wakes up the associated [`Waiter`].
    ///
    /// An interrupted wait is never completed by another task. The waiter notices the mark
    /// after waking and withdraws its operation.
    pub fn interrupt(&self) -> bool {
        self.interrupted.store(true, Ordering::Relaxed);
        self.wake_up()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }

    /// Returns the task that owns the associated [`Waiter`].
    pub fn pid(&self) -> Pid {
        self.pid
    }

    fn do_wait(&self, reason: WaitReason) {
        while !self.has_woken.swap(false, Ordering::Acquire) {
            self.scheduler.block_current_task(reason);
        }
    }
}

impl Debug for Waker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Waker")
            .field("has_woken", &self.has_woken)
            .field("interrupted", &self.interrupted)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::ThreadScheduler;

    #[test]
    fn wake_before_wait_is_not_lost() {
        let scheduler = ThreadScheduler::new();
        let dyn_scheduler: Arc<dyn Scheduler> = scheduler.clone();
        scheduler.enter_task(1);

        let (waiter, waker) = Waiter::new_pair(&dyn_scheduler);
        assert_eq!(waker.pid(), 1);
        assert!(waker.wake_up());
        assert!(!waker.wake_up());
        waiter.wait(WaitReason::Semaphore);
    }

    #[test]
    fn wake_from_another_task() {
        let scheduler = ThreadScheduler::new();
        let dyn_scheduler: Arc<dyn Scheduler> = scheduler.clone();

        let (tx, rx) = std::sync::mpsc::channel();
        let sleeper = scheduler.spawn(7, move |scheduler| {
            let (waiter, waker) = Waiter::new_pair(&scheduler);
            tx.send(waker).unwrap();
            waiter.wait(WaitReason::MsgReceive);
        });

        let waker = rx.recv().unwrap();
        assert!(waker.interrupt());
        assert!(waker.is_interrupted());
        sleeper.join().unwrap();
        drop(dyn_scheduler);
    }
}
