// SPDX-License-Identifier: MPL-2.0

//! System V shared memory.
//!
//! A segment owns its backing pages until it is both marked for removal and detached
//! from every address space. Both conditions are checked under the segment lock, so
//! exactly one of the last detach and `IPC_RMID` releases the pages.

mod ipc_types;

use core::sync::atomic::{AtomicUsize, Ordering};

pub use self::ipc_types::ShmidDs;
use super::{AddressSpace, FrameAllocator, Pages, page_align_up, perms::VmPerms};
use crate::{
    config::ShmLimits,
    ipc::{IpcFlags, IpcIds, IpcObject, KernelServices, PermissionMode, key_t},
    prelude::*,
    time::Clock,
};

/// The alignment of attach addresses.
pub const SHMLBA: usize = PAGE_SIZE;

/// The mode bit reported by `IPC_STAT` once a segment is marked for removal.
pub const SHM_DEST: u16 = 0o1000;

bitflags! {
    /// Flags for `shmat()` (shared memory attach) operations.
    pub struct ShmFlags: u32 {
        /// Read-only access (equivalent to `SHM_RDONLY`).
        const RDONLY = 0o10000;
        /// Round attach address to SHMLBA boundary (equivalent to `SHM_RND`).
        const RND    = 0o20000;
        /// Execution access (equivalent to `SHM_EXEC`).
        const EXEC   = 0o100000;
    }
}

/// A shared-memory segment.
pub struct SharedMemObj {
    /// The size requested at creation.
    size: usize,
    /// PID of creator
    cpid: Pid,
    inner: SpinLock<ShmInner>,
}

struct ShmInner {
    /// The backing pages, `None` once the segment is destroyed.
    pages: Option<Arc<dyn Pages>>,
    nattch: usize,
    marked: bool,
    atime: u64,
    dtime: u64,
    ctime: u64,
    /// PID of last operator
    lpid: Pid,
}

impl SharedMemObj {
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn nr_pages(&self) -> usize {
        page_align_up(self.size) / PAGE_SIZE
    }

    pub fn nattch(&self) -> usize {
        self.inner.lock().nattch
    }

    pub fn is_marked_for_removal(&self) -> bool {
        self.inner.lock().marked
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().pages.is_none()
    }
}

impl Debug for SharedMemObj {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SharedMemObj")
            .field("size", &self.size)
            .field("cpid", &self.cpid)
            .field("nattch", &inner.nattch)
            .field("marked", &inner.marked)
            .field("destroyed", &inner.pages.is_none())
            .finish()
    }
}

struct Attachment {
    shmid: i32,
    obj: Arc<IpcObject<SharedMemObj>>,
    size: usize,
    vm: Arc<dyn AddressSpace>,
}

/// The shared-memory segments of a namespace and their attachments.
pub struct ShmManager {
    ids: IpcIds<SharedMemObj>,
    /// Attachments keyed by the attaching task and the start address.
    attachments: SpinLock<BTreeMap<(Pid, Vaddr), Attachment>>,
    /// Pages backing live segments.
    total_pages: AtomicUsize,
    limits: ShmLimits,
    frame_allocator: Arc<dyn FrameAllocator>,
    clock: Arc<dyn Clock>,
}

impl ShmManager {
    pub fn new(limits: ShmLimits, services: &KernelServices) -> Self {
        Self {
            ids: IpcIds::new("shared memory", limits.shmmni),
            attachments: SpinLock::new(BTreeMap::new()),
            total_pages: AtomicUsize::new(0),
            limits,
            frame_allocator: services.frame_allocator.clone(),
            clock: services.clock.clone(),
        }
    }

    pub fn ids(&self) -> &IpcIds<SharedMemObj> {
        &self.ids
    }

    /// Returns the number of pages backing live segments.
    pub fn total_pages(&self) -> usize {
        self.total_pages.load(Ordering::Relaxed)
    }

    /// Returns the id of the segment with `key`, creating a segment of `size` bytes if
    /// needed.
    pub fn get_or_create(
        &self,
        key: key_t,
        size: usize,
        flags: IpcFlags,
        mode: u16,
        credentials: &Credentials,
        pid: Pid,
    ) -> Result<i32> {
        self.ids.get_or_create(
            key,
            flags,
            mode,
            credentials,
            |shm_obj| {
                if size > shm_obj.payload().size() {
                    return_errno_with_message!(Errno::EINVAL, "the segment is smaller");
                }
                Ok(())
            },
            |_| self.create(size, pid),
        )
    }

    fn create(&self, size: usize, pid: Pid) -> Result<SharedMemObj> {
        if size < self.limits.shmmin || size > self.limits.shmmax {
            return_errno_with_message!(Errno::EINVAL, "the size is out of range");
        }

        let nr_pages = page_align_up(size) / PAGE_SIZE;
        if self.total_pages() + nr_pages > self.limits.shmall {
            return_errno_with_message!(Errno::ENOSPC, "too many shared-memory pages");
        }
        let pages = self.frame_allocator.allocate_pages(nr_pages)?;
        self.total_pages.fetch_add(nr_pages, Ordering::Relaxed);

        Ok(SharedMemObj {
            size,
            cpid: pid,
            inner: SpinLock::new(ShmInner {
                pages: Some(pages),
                nattch: 0,
                marked: false,
                atime: 0,
                dtime: 0,
                ctime: self.now(),
                lpid: 0,
            }),
        })
    }

    /// Maps the segment `shmid` into `vm` and returns the start address.
    ///
    /// A zero `addr` lets the address space choose.
    pub fn attach(
        &self,
        shmid: i32,
        addr: Vaddr,
        flags: ShmFlags,
        credentials: &Credentials,
        pid: Pid,
        vm: &Arc<dyn AddressSpace>,
    ) -> Result<Vaddr> {
        let hint = if addr == 0 {
            None
        } else if addr % SHMLBA == 0 {
            Some(addr)
        } else if flags.contains(ShmFlags::RND) {
            Some(addr - addr % SHMLBA).filter(|&addr| addr != 0)
        } else {
            return_errno_with_message!(Errno::EINVAL, "the address is not aligned");
        };

        let mut perms = if flags.contains(ShmFlags::RDONLY) {
            VmPerms::READ
        } else {
            VmPerms::READ | VmPerms::WRITE
        };
        if flags.contains(ShmFlags::EXEC) {
            perms |= VmPerms::EXEC;
        }

        let shm_obj = self.ids.get(shmid)?;
        shm_obj.check_access(credentials, perms.into())?;

        let segment = shm_obj.payload();
        let pages = {
            let mut inner = segment.inner.lock();
            let Some(pages) = inner.pages.clone() else {
                return_errno_with_message!(Errno::EIDRM, "the segment is removed");
            };
            inner.nattch += 1;
            pages
        };

        let size = page_align_up(segment.size);
        let addr = match vm.map(pages, size, perms, hint) {
            Ok(addr) => addr,
            Err(err) => {
                self.put_attach(shmid, &shm_obj, None);
                return Err(err);
            }
        };

        {
            let mut inner = segment.inner.lock();
            inner.atime = self.now();
            inner.lpid = pid;
        }
        self.attachments.lock().insert(
            (pid, addr),
            Attachment {
                shmid,
                obj: shm_obj,
                size,
                vm: vm.clone(),
            },
        );

        debug!("[shm] attach shmid = {} at {:#x} for pid = {}", shmid, addr, pid);
        Ok(addr)
    }

    /// Unmaps the segment that `pid` attached at `addr`.
    pub fn detach(&self, addr: Vaddr, pid: Pid) -> Result<()> {
        let Some(attachment) = self.attachments.lock().remove(&(pid, addr)) else {
            return_errno_with_message!(Errno::EINVAL, "no segment is attached at the address");
        };

        if let Err(err) = attachment.vm.unmap(addr, attachment.size) {
            self.attachments.lock().insert((pid, addr), attachment);
            return Err(err);
        }

        debug!("[shm] detach shmid = {} at {:#x} for pid = {}", attachment.shmid, addr, pid);
        self.put_attach(attachment.shmid, &attachment.obj, Some(pid));
        Ok(())
    }

    /// Detaches every segment attached by `pid`.
    pub fn detach_all(&self, pid: Pid) {
        let detached: Vec<_> = {
            let mut attachments = self.attachments.lock();
            let addrs: Vec<Vaddr> = attachments
                .range((pid, 0)..=(pid, Vaddr::MAX))
                .map(|(&(_, addr), _)| addr)
                .collect();
            addrs
                .into_iter()
                .filter_map(|addr| Some((addr, attachments.remove(&(pid, addr))?)))
                .collect()
        };

        for (addr, attachment) in detached {
            if let Err(err) = attachment.vm.unmap(addr, attachment.size) {
                warn!("[shm] failed to unmap {:#x} of pid = {}: {}", addr, pid, err);
            }
            self.put_attach(attachment.shmid, &attachment.obj, Some(pid));
        }
    }

    /// Marks the segment `shmid` for removal on behalf of `credentials`.
    ///
    /// The key is detached at once. The segment is destroyed now if it is not attached,
    /// otherwise by its last detach.
    pub fn mark_for_removal(&self, shmid: i32, credentials: &Credentials) -> Result<()> {
        let shm_obj = self.ids.detach_key(shmid, credentials, SHM_DEST)?;

        let destroyed = {
            let mut inner = shm_obj.payload().inner.lock();
            inner.marked = true;
            inner.ctime = self.now();
            if inner.nattch == 0 {
                inner.pages.take()
            } else {
                None
            }
        };
        if let Some(pages) = destroyed {
            self.destroy(shmid, pages);
        }
        Ok(())
    }

    /// Returns the status of the segment `shmid`, as `IPC_STAT` does.
    pub fn stat(&self, shmid: i32, credentials: &Credentials) -> Result<ShmidDs> {
        let shm_obj = self.ids.get(shmid)?;
        shm_obj.check_access(credentials, PermissionMode::READ)?;

        let permission = shm_obj.permission();
        let segment = shm_obj.payload();
        let inner = segment.inner.lock();
        Ok(ShmidDs {
            shm_perm: permission.to_c(),
            shm_segsz: segment.size,
            shm_atime: inner.atime as i64,
            shm_dtime: inner.dtime as i64,
            shm_ctime: inner.ctime as i64,
            shm_cpid: segment.cpid as i32,
            shm_lpid: inner.lpid as i32,
            shm_nattch: inner.nattch as u64,
            ..Default::default()
        })
    }

    /// Changes the owner and the mode of the segment `shmid`, as `IPC_SET` does.
    pub fn set(&self, shmid: i32, shmid_ds: &ShmidDs, credentials: &Credentials) -> Result<()> {
        let shm_obj = self.ids.get(shmid)?;
        let perm = &shmid_ds.shm_perm;
        shm_obj.set_permission(credentials, perm.uid, perm.gid, perm.mode)?;
        shm_obj.payload().inner.lock().ctime = self.now();
        Ok(())
    }

    /// Drops one attach count taken by [`Self::attach`].
    fn put_attach(&self, shmid: i32, shm_obj: &IpcObject<SharedMemObj>, pid: Option<Pid>) {
        let destroyed = {
            let mut inner = shm_obj.payload().inner.lock();
            inner.nattch -= 1;
            if let Some(pid) = pid {
                inner.dtime = self.now();
                inner.lpid = pid;
            }
            if inner.nattch == 0 && inner.marked {
                inner.pages.take()
            } else {
                None
            }
        };
        if let Some(pages) = destroyed {
            self.destroy(shmid, pages);
        }
    }

    fn destroy(&self, shmid: i32, pages: Arc<dyn Pages>) {
        self.ids.evict(shmid);
        self.total_pages.fetch_sub(pages.nr_pages(), Ordering::Relaxed);
        debug!("[shm] destroy shmid = {}", shmid);
    }

    fn now(&self) -> u64 {
        self.clock.now().as_secs()
    }
}

impl Debug for ShmManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShmManager")
            .field("limits", &self.limits)
            .field("total_pages", &self.total_pages())
            .finish_non_exhaustive()
    }
}
