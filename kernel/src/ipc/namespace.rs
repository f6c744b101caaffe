// SPDX-License-Identifier: MPL-2.0

use super::{
    IpcIds, KernelServices, avoidance::Avoidance, msg_queue::MsgQueue,
    semaphore::system_v::{self, sem_set::SemaphoreSet},
};
use crate::{config::IpcConfig, prelude::*, sync::Waker, vm::shared_mem::ShmManager};

/// All System V IPC objects visible to a group of tasks.
pub struct IpcNamespace {
    config: IpcConfig,
    services: KernelServices,
    sem_ids: IpcIds<SemaphoreSet>,
    msg_ids: IpcIds<MsgQueue>,
    shm: ShmManager,
    avoidance: Avoidance,
    /// The tasks blocked in an IPC operation.
    sleepers: SpinLock<BTreeMap<Pid, Arc<Waker>>>,
}

impl IpcNamespace {
    pub fn new(config: IpcConfig, services: KernelServices) -> Arc<Self> {
        Arc::new(Self {
            sem_ids: IpcIds::new("semaphore set", config.sem.semmni),
            msg_ids: IpcIds::new("message queue", config.msg.msgmni),
            shm: ShmManager::new(config.shm, &services),
            avoidance: Avoidance::new(config.avoidance),
            sleepers: SpinLock::new(BTreeMap::new()),
            config,
            services,
        })
    }

    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    pub fn services(&self) -> &KernelServices {
        &self.services
    }

    pub fn sem_ids(&self) -> &IpcIds<SemaphoreSet> {
        &self.sem_ids
    }

    pub fn msg_ids(&self) -> &IpcIds<MsgQueue> {
        &self.msg_ids
    }

    pub fn shm(&self) -> &ShmManager {
        &self.shm
    }

    pub fn avoidance(&self) -> &Avoidance {
        &self.avoidance
    }

    /// Records that the owner of `waker` is about to block.
    ///
    /// The record is dropped with the returned guard.
    pub(crate) fn register_sleeper(&self, waker: Arc<Waker>) -> SleeperGuard<'_> {
        let pid = waker.pid();
        self.sleepers.lock().insert(pid, waker);
        SleeperGuard { ns: self, pid }
    }

    /// Interrupts the IPC wait of `pid`, e.g., for a signal.
    ///
    /// The blocked call withdraws its operation and fails with `EINTR`. Returns whether
    /// the task was blocked.
    pub fn interrupt_task(&self, pid: Pid) -> bool {
        let waker = self.sleepers.lock().get(&pid).cloned();
        let Some(waker) = waker else {
            return false;
        };

        debug!("[ipc] interrupt pid = {}", pid);
        waker.interrupt();
        true
    }

    /// Releases everything that `pid` holds in this namespace.
    ///
    /// The pending wait of the task is interrupted, its semaphore adjustments are applied,
    /// its deadlock-avoidance row is retired and its shared-memory segments are detached.
    pub fn exit_task(&self, pid: Pid) {
        debug!("[ipc] exit pid = {}", pid);
        self.interrupt_task(pid);

        for sem_set in self.sem_ids.objects() {
            sem_set.payload().exit_task(sem_set.id(), pid, self);
        }
        self.avoidance.retire_task(pid);
        system_v::retry_unsafe_blocked(self);

        self.shm.detach_all(pid);
    }
}

impl Debug for IpcNamespace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IpcNamespace")
            .field("config", &self.config)
            .field("avoidance", &self.avoidance)
            .finish_non_exhaustive()
    }
}

pub(crate) struct SleeperGuard<'a> {
    ns: &'a IpcNamespace,
    pid: Pid,
}

impl Drop for SleeperGuard<'_> {
    fn drop(&mut self) {
        self.ns.sleepers.lock().remove(&self.pid);
    }
}

#[cfg(test)]
mod test {
    use crate::test_util::TestEnv;

    #[test]
    fn interrupt_idle_task() {
        let env = TestEnv::new();
        assert!(!env.ns.interrupt_task(42));

        // Exiting a task that never used IPC is a no-op.
        env.ns.exit_task(42);
        assert!(env.ns.avoidance().is_safe());
        assert_eq!(env.ns.shm().total_pages(), 0);
    }
}
