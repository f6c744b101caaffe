// SPDX-License-Identifier: MPL-2.0

//! Doubles of the kernel services for unit tests.
//!
//! Every task of a test runs on its own host thread. Blocking parks the thread and waking
//! unparks it.

use std::{
    cell::Cell,
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle, Thread},
    time::Instant,
};

use crate::{
    config::IpcConfig,
    ipc::{IpcNamespace, KernelServices},
    prelude::*,
    process::{Gid, Uid},
    sched::{Scheduler, WaitReason},
    syscall::Context,
    time::Clock,
    vm::{AddressSpace, FrameAllocator, Pages, VmIo, perms::VmPerms},
};

thread_local! {
    static CURRENT: Cell<Pid> = const { Cell::new(0) };
}

#[derive(Default)]
pub struct ThreadScheduler {
    threads: Mutex<HashMap<Pid, Thread>>,
}

impl ThreadScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the calling thread the task `pid`.
    pub fn enter_task(&self, pid: Pid) {
        CURRENT.with(|current| current.set(pid));
        self.threads.lock().unwrap().insert(pid, thread::current());
    }

    /// Runs `f` as the task `pid` on a new thread.
    pub fn spawn<F, R>(self: &Arc<Self>, pid: Pid, f: F) -> JoinHandle<R>
    where
        F: FnOnce(Arc<dyn Scheduler>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let scheduler = self.clone();
        thread::spawn(move || {
            scheduler.enter_task(pid);
            f(scheduler)
        })
    }
}

impl Scheduler for ThreadScheduler {
    fn current_task_id(&self) -> Pid {
        CURRENT.with(Cell::get)
    }

    fn block_current_task(&self, _reason: WaitReason) {
        thread::park();
    }

    fn wake_task(&self, pid: Pid) {
        if let Some(thread) = self.threads.lock().unwrap().get(&pid) {
            thread.unpark();
        }
    }
}

pub struct TestPages {
    data: Mutex<Vec<u8>>,
    nr_pages: usize,
    live_pages: Arc<AtomicUsize>,
}

impl VmIo for TestPages {
    fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let data = self.data.lock().unwrap();
        let src = offset
            .checked_add(buf.len())
            .and_then(|end| data.get(offset..end))
            .ok_or(Error::new(Errno::EFAULT))?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_bytes(&self, offset: usize, buf: &[u8]) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let dst = offset
            .checked_add(buf.len())
            .and_then(|end| data.get_mut(offset..end))
            .ok_or(Error::new(Errno::EFAULT))?;
        dst.copy_from_slice(buf);
        Ok(())
    }
}

impl Pages for TestPages {
    fn nr_pages(&self) -> usize {
        self.nr_pages
    }
}

impl Drop for TestPages {
    fn drop(&mut self) {
        self.live_pages.fetch_sub(self.nr_pages, Ordering::Relaxed);
    }
}

/// A page allocator that counts the pages alive and fails beyond a limit.
pub struct TestFrameAllocator {
    live_pages: Arc<AtomicUsize>,
    limit: usize,
}

impl TestFrameAllocator {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            live_pages: Arc::new(AtomicUsize::new(0)),
            limit,
        })
    }

    pub fn live_pages(&self) -> usize {
        self.live_pages.load(Ordering::Relaxed)
    }
}

impl FrameAllocator for TestFrameAllocator {
    fn allocate_pages(&self, count: usize) -> Result<Arc<dyn Pages>> {
        if self.live_pages() + count > self.limit {
            return_errno_with_message!(Errno::ENOMEM, "the test allocator is exhausted");
        }
        self.live_pages.fetch_add(count, Ordering::Relaxed);
        Ok(Arc::new(TestPages {
            data: Mutex::new(vec![0; count * PAGE_SIZE]),
            nr_pages: count,
            live_pages: self.live_pages.clone(),
        }))
    }
}

struct Mapping {
    pages: Arc<dyn Pages>,
    size: usize,
    perms: VmPerms,
}

/// An address space that records mappings and accesses their pages by address.
pub struct TestAddressSpace {
    mappings: Mutex<BTreeMap<Vaddr, Mapping>>,
    next_addr: Mutex<Vaddr>,
}

impl TestAddressSpace {
    const BASE: Vaddr = 0x1000_0000;

    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mappings: Mutex::new(BTreeMap::new()),
            next_addr: Mutex::new(Self::BASE),
        })
    }

    pub fn nr_mappings(&self) -> usize {
        self.mappings.lock().unwrap().len()
    }

    pub fn read(&self, addr: Vaddr, buf: &mut [u8]) -> Result<()> {
        self.access(addr, buf.len(), VmPerms::READ, |pages, offset| {
            pages.read_bytes(offset, buf)
        })
    }

    pub fn write(&self, addr: Vaddr, buf: &[u8]) -> Result<()> {
        self.access(addr, buf.len(), VmPerms::WRITE, |pages, offset| {
            pages.write_bytes(offset, buf)
        })
    }

    fn access(
        &self,
        addr: Vaddr,
        len: usize,
        required: VmPerms,
        f: impl FnOnce(&dyn Pages, usize) -> Result<()>,
    ) -> Result<()> {
        let mappings = self.mappings.lock().unwrap();
        let (&start, mapping) = mappings
            .range(..=addr)
            .next_back()
            .ok_or(Error::new(Errno::EFAULT))?;
        if addr + len > start + mapping.size || !mapping.perms.contains(required) {
            return_errno!(Errno::EFAULT);
        }
        f(mapping.pages.as_ref(), addr - start)
    }
}

impl AddressSpace for TestAddressSpace {
    fn map(
        &self,
        pages: Arc<dyn Pages>,
        size: usize,
        perms: VmPerms,
        hint: Option<Vaddr>,
    ) -> Result<Vaddr> {
        let mut mappings = self.mappings.lock().unwrap();
        let addr = match hint {
            Some(addr) => {
                let overlaps = mappings
                    .iter()
                    .any(|(&start, mapping)| addr < start + mapping.size && start < addr + size);
                if overlaps {
                    return_errno_with_message!(Errno::EINVAL, "the address is in use");
                }
                addr
            }
            None => {
                let mut next_addr = self.next_addr.lock().unwrap();
                let addr = *next_addr;
                // Leave a guard page between mappings.
                *next_addr += size + PAGE_SIZE;
                addr
            }
        };

        mappings.insert(addr, Mapping { pages, size, perms });
        Ok(addr)
    }

    fn unmap(&self, addr: Vaddr, size: usize) -> Result<()> {
        let mut mappings = self.mappings.lock().unwrap();
        match mappings.get(&addr) {
            Some(mapping) if mapping.size == size => {
                mappings.remove(&addr);
                Ok(())
            }
            _ => return_errno_with_message!(Errno::EINVAL, "no such mapping"),
        }
    }
}

/// A clock that only moves when told to.
pub struct TestClock {
    secs: AtomicU64,
}

impl TestClock {
    pub fn new(secs: u64) -> Arc<Self> {
        Arc::new(Self {
            secs: AtomicU64::new(secs),
        })
    }

    pub fn set(&self, secs: u64) {
        self.secs.store(secs, Ordering::Relaxed);
    }
}

impl Clock for TestClock {
    fn now(&self) -> Duration {
        Duration::from_secs(self.secs.load(Ordering::Relaxed))
    }
}

/// A namespace wired to test doubles.
pub struct TestEnv {
    pub ns: Arc<IpcNamespace>,
    pub scheduler: Arc<ThreadScheduler>,
    pub frames: Arc<TestFrameAllocator>,
    pub clock: Arc<TestClock>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(IpcConfig::default())
    }

    pub fn with_config(config: IpcConfig) -> Self {
        let scheduler = ThreadScheduler::new();
        let frames = TestFrameAllocator::new(1024);
        let clock = TestClock::new(1_700_000_000);
        let services = KernelServices {
            scheduler: scheduler.clone(),
            frame_allocator: frames.clone(),
            clock: clock.clone(),
        };
        Self {
            ns: IpcNamespace::new(config, services),
            scheduler,
            frames,
            clock,
        }
    }

    /// Creates a task owned by an unprivileged user.
    pub fn task(&self, pid: Pid) -> TestTask {
        self.task_with(pid, Credentials::new(Uid::new(1000), Gid::new(1000)))
    }

    pub fn task_with(&self, pid: Pid, credentials: Credentials) -> TestTask {
        let space = TestAddressSpace::new();
        TestTask {
            pid,
            credentials,
            vm: space.clone(),
            space,
            ns: self.ns.clone(),
        }
    }

    /// Runs `f` as `task` on a new thread.
    pub fn spawn<F, R>(&self, task: TestTask, f: F) -> JoinHandle<R>
    where
        F: FnOnce(TestTask) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.scheduler.spawn(task.pid, move |_| f(task))
    }
}

pub struct TestTask {
    pub pid: Pid,
    pub credentials: Credentials,
    pub vm: Arc<dyn AddressSpace>,
    pub space: Arc<TestAddressSpace>,
    pub ns: Arc<IpcNamespace>,
}

impl TestTask {
    pub fn ctx(&self) -> Context<'_> {
        Context {
            ipc_ns: &self.ns,
            pid: self.pid,
            credentials: &self.credentials,
            vm: &self.vm,
        }
    }
}

/// Polls `cond` until it holds, failing the test after a generous deadline.
pub fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + std::time::Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "the condition never held");
        thread::yield_now();
    }
}
