// SPDX-License-Identifier: MPL-2.0

//! The scheduler services consumed by blocking IPC operations.

use crate::process::Pid;

/// Why a task is blocked.
///
/// The scheduler may use this for accounting and debugging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// Waiting for a semaphore operation list to become feasible.
    Semaphore,
    /// Waiting for room in a message queue.
    MsgSend,
    /// Waiting for a matching message.
    MsgReceive,
}

/// The scheduler of the embedding kernel.
pub trait Scheduler: Send + Sync {
    /// Returns the id of the task running on the current CPU.
    fn current_task_id(&self) -> Pid;

    /// Puts the current task to sleep.
    ///
    /// The call returns after [`Self::wake_task`] has been invoked on the task.
    /// A wake-up that arrives before the task actually sleeps must not be lost;
    /// spurious returns are allowed.
    fn block_current_task(&self, reason: WaitReason);

    /// Makes a task runnable again.
    fn wake_task(&self, pid: Pid);
}
