// SPDX-License-Identifier: MPL-2.0

//! System V inter-process communication.
//!
//! Every IPC object lives in an [`IpcNamespace`], which owns one id table per kind
//! of object (see [`IpcIds`]). The namespace of the kernel is created by [`init`];
//! callers without a namespace of their own use [`init_ns`].

use spin::Once;

use crate::{
    prelude::*,
    sched::Scheduler,
    time::Clock,
    vm::FrameAllocator,
};

pub mod avoidance;
pub mod msg_queue;
mod namespace;
mod perm;
mod registry;
pub mod semaphore;

pub use self::{
    namespace::IpcNamespace,
    perm::{IpcPerm, IpcPermission, PermissionMode},
    registry::{IPCMNI, IpcIds, IpcObject},
};
use crate::config::IpcConfig;

#[expect(non_camel_case_types)]
pub type key_t = i32;

/// The key that always creates a new object.
pub const IPC_PRIVATE: key_t = 0;

bitflags! {
    pub struct IpcFlags: u32 {
        /// Create key if key does not exist
        const IPC_CREAT = 1 << 9;
        /// Fail if key exists
        const IPC_EXCL = 1 << 10;
        /// Return error on wait
        const IPC_NOWAIT = 1 << 11;
    }
}

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[expect(non_camel_case_types)]
pub enum IpcControlCmd {
    IPC_RMID = 0,
    IPC_SET = 1,
    IPC_STAT = 2,
    IPC_INFO = 3,

    SEM_GETPID = 11,
    SEM_GETVAL = 12,
    SEM_GETALL = 13,
    SEM_GETNCNT = 14,
    SEM_GETZCNT = 15,
    SEM_SETVAL = 16,
    SEM_SETALL = 17,
    /// Declares the maximum claim of the caller on every semaphore of a set.
    SEM_SETCLAIM = 64,
}

/// The services of the embedding kernel that the IPC subsystem relies on.
#[derive(Clone)]
pub struct KernelServices {
    pub scheduler: Arc<dyn Scheduler>,
    pub frame_allocator: Arc<dyn FrameAllocator>,
    pub clock: Arc<dyn Clock>,
}

impl KernelServices {
    /// Returns the current time in seconds, the resolution of IPC timestamps.
    pub(crate) fn now_secs(&self) -> u64 {
        self.clock.now().as_secs()
    }
}

impl Debug for KernelServices {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KernelServices").finish_non_exhaustive()
    }
}

static INIT_NS: Once<Arc<IpcNamespace>> = Once::new();

/// Initializes the IPC namespace of the kernel.
///
/// Only the first call takes effect; later calls are ignored and logged.
pub fn init(config: IpcConfig, services: KernelServices) {
    let mut initialized = false;
    INIT_NS.call_once(|| {
        initialized = true;
        IpcNamespace::new(config, services)
    });

    if initialized {
        info!("[ipc] initialized with {:?}", config);
    } else {
        warn!("[ipc] already initialized, ignore the new configuration");
    }
}

/// Returns the IPC namespace created by [`init`].
pub fn init_ns() -> Option<&'static Arc<IpcNamespace>> {
    INIT_NS.get()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{config::AvoidancePolicy, test_util::TestEnv};

    #[test]
    fn init_only_once() {
        let env = TestEnv::new();
        let services = env.ns.services().clone();

        init(IpcConfig::default(), services.clone());
        let ns = init_ns().unwrap().clone();

        let config = IpcConfig {
            avoidance: AvoidancePolicy::Bypass,
            ..IpcConfig::default()
        };
        init(config, services);

        assert!(Arc::ptr_eq(&ns, init_ns().unwrap()));
        assert_eq!(ns.config().avoidance, AvoidancePolicy::Enforce);
    }
}
