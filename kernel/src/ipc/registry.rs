// SPDX-License-Identifier: MPL-2.0

use bitvec::prelude::*;

use super::{IPC_PRIVATE, IpcFlags, IpcPermission, PermissionMode, key_t};
use crate::prelude::*;

/// The number of slots that an id table can address.
///
/// An id encodes a slot index and the sequence number of the slot as
/// `seq * IPCMNI + index`, so a stale id never refers to a newer object in the same slot.
pub const IPCMNI: usize = 32768;

/// An IPC object: an id, a permission and the payload of a specific kind.
pub struct IpcObject<T> {
    id: i32,
    permission: SpinLock<IpcPermission>,
    payload: T,
}

impl<T> IpcObject<T> {
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Returns a snapshot of the permission.
    pub fn permission(&self) -> IpcPermission {
        self.permission.lock().clone()
    }

    pub fn check_access(&self, credentials: &Credentials, requested: PermissionMode) -> Result<()> {
        self.permission.lock().check_access(credentials, requested)
    }

    pub fn check_owner(&self, credentials: &Credentials) -> Result<()> {
        self.permission.lock().check_owner(credentials)
    }

    /// Applies `IPC_SET` on behalf of `credentials`.
    pub fn set_permission(
        &self,
        credentials: &Credentials,
        uid: u32,
        gid: u32,
        mode: u16,
    ) -> Result<()> {
        let mut permission = self.permission.lock();
        permission.check_owner(credentials)?;
        permission.set(uid.into(), gid.into(), mode);
        Ok(())
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }
}

impl<T: Debug> Debug for IpcObject<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IpcObject")
            .field("id", &self.id)
            .field("permission", &*self.permission.lock())
            .field("payload", &self.payload)
            .finish()
    }
}

enum Slot<T> {
    /// A free slot. The next object placed here gets `seq`.
    Vacant { seq: u16 },
    Occupied(Arc<IpcObject<T>>),
}

struct IdsInner<T> {
    slots: Vec<Slot<T>>,
    /// The slots in use.
    allocated: BitVec,
    keys: BTreeMap<key_t, usize>,
}

/// The id table of one kind of IPC object.
pub struct IpcIds<T> {
    kind: &'static str,
    inner: RwLock<IdsInner<T>>,
}

impl<T> IpcIds<T> {
    /// Creates a table holding at most `capacity` objects.
    pub fn new(kind: &'static str, capacity: usize) -> Self {
        let capacity = capacity.min(IPCMNI);
        Self {
            kind,
            inner: RwLock::new(IdsInner {
                slots: Vec::new(),
                allocated: BitVec::repeat(false, capacity),
                keys: BTreeMap::new(),
            }),
        }
    }

    /// Returns the id of the object with `key`, creating the object if needed.
    ///
    /// `check_existing` performs the kind-specific checks on an existing object, after the
    /// access check. `create` builds the payload of a new object with the given id.
    pub fn get_or_create<C, N>(
        &self,
        key: key_t,
        flags: IpcFlags,
        mode: u16,
        credentials: &Credentials,
        check_existing: C,
        create: N,
    ) -> Result<i32>
    where
        C: FnOnce(&IpcObject<T>) -> Result<()>,
        N: FnOnce(i32) -> Result<T>,
    {
        let mut inner = self.inner.write();

        if key != IPC_PRIVATE {
            if let Some(&index) = inner.keys.get(&key) {
                if flags.contains(IpcFlags::IPC_CREAT | IpcFlags::IPC_EXCL) {
                    return_errno_with_message!(Errno::EEXIST, "the key already exists");
                }
                let Slot::Occupied(object) = &inner.slots[index] else {
                    unreachable!("a key refers to a vacant slot");
                };
                object.check_access(credentials, PermissionMode::from_bits_truncate(mode))?;
                check_existing(object)?;
                return Ok(object.id);
            }

            if !flags.contains(IpcFlags::IPC_CREAT) {
                return_errno_with_message!(Errno::ENOENT, "the key does not exist");
            }
        }

        let Some(index) = inner.allocated.first_zero() else {
            return_errno_with_message!(Errno::ENOSPC, "the id table is full");
        };
        if index == inner.slots.len() {
            inner.slots.push(Slot::Vacant { seq: 0 });
        }
        let Slot::Vacant { seq } = inner.slots[index] else {
            unreachable!("an allocated slot is not in the bitmap");
        };

        let id = seq as i32 * IPCMNI as i32 + index as i32;
        let payload = create(id)?;
        let object = Arc::new(IpcObject {
            id,
            permission: SpinLock::new(IpcPermission::new(key, seq, mode, credentials)),
            payload,
        });

        inner.slots[index] = Slot::Occupied(object);
        inner.allocated.set(index, true);
        if key != IPC_PRIVATE {
            inner.keys.insert(key, index);
        }

        debug!("[ipc] create {} id = {}, key = {}", self.kind, id, key);
        Ok(id)
    }

    /// Looks up the object with `id`.
    pub fn get(&self, id: i32) -> Result<Arc<IpcObject<T>>> {
        let inner = self.inner.read();
        let index = id_to_index(id)?;
        match inner.slots.get(index) {
            Some(Slot::Occupied(object)) if object.id == id => Ok(object.clone()),
            _ => return_errno_with_message!(Errno::EINVAL, "the IPC id does not exist"),
        }
    }

    /// Returns a snapshot of the permission of the object with `id`.
    pub fn lookup_permission(&self, id: i32) -> Result<IpcPermission> {
        Ok(self.get(id)?.permission())
    }

    /// Removes the object with `id` on behalf of `credentials`.
    ///
    /// Only the owner, the creator or a task with `CAP_SYS_ADMIN` may remove an object.
    pub fn remove(&self, id: i32, credentials: &Credentials) -> Result<Arc<IpcObject<T>>> {
        let mut inner = self.inner.write();
        let object = inner.object(id)?;
        object.check_owner(credentials)?;
        Ok(inner.evict(id, self.kind))
    }

    /// Removes the object with `id` without checking permissions.
    ///
    /// Returns `None` if the object has already been removed.
    pub(crate) fn evict(&self, id: i32) -> Option<Arc<IpcObject<T>>> {
        let mut inner = self.inner.write();
        inner.object(id).ok()?;
        Some(inner.evict(id, self.kind))
    }

    /// Detaches the key of the object with `id` on behalf of `credentials`.
    ///
    /// The object stays reachable by its id; a later lookup of the key creates a new object.
    /// `extra_mode` is merged into the mode so `IPC_STAT` can report the state.
    pub(crate) fn detach_key(
        &self,
        id: i32,
        credentials: &Credentials,
        extra_mode: u16,
    ) -> Result<Arc<IpcObject<T>>> {
        let mut inner = self.inner.write();
        let object = inner.object(id)?;
        let mut permission = object.permission.lock();
        permission.check_owner(credentials)?;

        let key = permission.key();
        if key != IPC_PRIVATE && inner.keys.get(&key) == Some(&id_to_index(id)?) {
            inner.keys.remove(&key);
        }
        permission.detach_key(extra_mode);
        drop(permission);

        Ok(object)
    }

    /// Returns all live objects, in slot order.
    pub fn objects(&self) -> Vec<Arc<IpcObject<T>>> {
        self.inner
            .read()
            .slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Occupied(object) => Some(object.clone()),
                Slot::Vacant { .. } => None,
            })
            .collect()
    }

    /// Returns the number of live objects.
    pub fn len(&self) -> usize {
        self.inner.read().allocated.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> IdsInner<T> {
    fn object(&self, id: i32) -> Result<Arc<IpcObject<T>>> {
        let index = id_to_index(id)?;
        match self.slots.get(index) {
            Some(Slot::Occupied(object)) if object.id == id => Ok(object.clone()),
            _ => return_errno_with_message!(Errno::EINVAL, "the IPC id does not exist"),
        }
    }

    /// Vacates the slot of `id`, which must hold a live object.
    fn evict(&mut self, id: i32, kind: &str) -> Arc<IpcObject<T>> {
        let index = id as usize % IPCMNI;
        let seq = (id as usize / IPCMNI) as u16;
        let slot = core::mem::replace(
            &mut self.slots[index],
            Slot::Vacant {
                seq: seq.wrapping_add(1) & MAX_SEQ,
            },
        );
        let Slot::Occupied(object) = slot else {
            unreachable!("evicting a vacant slot");
        };
        self.allocated.set(index, false);

        let key = object.permission.lock().key();
        if key != IPC_PRIVATE && self.keys.get(&key) == Some(&index) {
            self.keys.remove(&key);
        }

        debug!("[ipc] remove {} id = {}", kind, id);
        object
    }
}

/// The largest sequence number that keeps ids positive.
const MAX_SEQ: u16 = (i32::MAX as usize / IPCMNI) as u16;

fn id_to_index(id: i32) -> Result<usize> {
    if id < 0 {
        return_errno_with_message!(Errno::EINVAL, "negative IPC id");
    }
    Ok(id as usize % IPCMNI)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::process::{Gid, Uid};

    fn owner() -> Credentials {
        Credentials::new(Uid::new(1000), Gid::new(100))
    }

    fn create(ids: &IpcIds<u32>, key: key_t, flags: IpcFlags, payload: u32) -> Result<i32> {
        ids.get_or_create(key, flags, 0o600, &owner(), |_| Ok(()), |_| Ok(payload))
    }

    #[test]
    fn key_semantics() {
        let ids = IpcIds::new("test", 8);

        assert_eq!(
            create(&ids, 7, IpcFlags::empty(), 0).unwrap_err().error(),
            Errno::ENOENT
        );
        let id = create(&ids, 7, IpcFlags::IPC_CREAT, 1).unwrap();
        assert_eq!(create(&ids, 7, IpcFlags::IPC_CREAT, 2).unwrap(), id);
        assert_eq!(create(&ids, 7, IpcFlags::empty(), 2).unwrap(), id);
        assert_eq!(
            create(&ids, 7, IpcFlags::IPC_CREAT | IpcFlags::IPC_EXCL, 2)
                .unwrap_err()
                .error(),
            Errno::EEXIST
        );
        assert_eq!(*ids.get(id).unwrap().payload(), 1);

        let private_a = create(&ids, IPC_PRIVATE, IpcFlags::empty(), 3).unwrap();
        let private_b = create(&ids, IPC_PRIVATE, IpcFlags::IPC_CREAT, 4).unwrap();
        assert_ne!(private_a, private_b);
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn access_is_checked_on_lookup() {
        let ids = IpcIds::new("test", 8);
        create(&ids, 7, IpcFlags::IPC_CREAT, 1).unwrap();

        let stranger = Credentials::new(Uid::new(2000), Gid::new(200));
        let result = ids.get_or_create(7, IpcFlags::empty(), 0o400, &stranger, |_| Ok(()), |_| {
            Ok(0)
        });
        assert_eq!(result.unwrap_err().error(), Errno::EACCES);

        let result = ids.get_or_create(7, IpcFlags::empty(), 0, &owner(), |_| {
            Err(Error::new(Errno::EINVAL))
        }, |_| Ok(0));
        assert_eq!(result.unwrap_err().error(), Errno::EINVAL);
    }

    #[test]
    fn stale_ids_do_not_alias() {
        let ids = IpcIds::new("test", 8);
        let first = create(&ids, 7, IpcFlags::IPC_CREAT, 1).unwrap();

        let stranger = Credentials::new(Uid::new(2000), Gid::new(200));
        assert_eq!(
            ids.remove(first, &stranger).unwrap_err().error(),
            Errno::EPERM
        );
        ids.remove(first, &owner()).unwrap();
        assert_eq!(ids.get(first).unwrap_err().error(), Errno::EINVAL);

        let second = create(&ids, 7, IpcFlags::IPC_CREAT, 2).unwrap();
        assert_ne!(first, second);
        assert_eq!(first as usize % IPCMNI, second as usize % IPCMNI);
        assert_eq!(ids.lookup_permission(second).unwrap().seq(), 1);
        assert_eq!(ids.get(first).unwrap_err().error(), Errno::EINVAL);
        assert!(ids.evict(first).is_none());
    }

    #[test]
    fn table_exhaustion() {
        let ids = IpcIds::new("test", 2);
        let a = create(&ids, IPC_PRIVATE, IpcFlags::empty(), 0).unwrap();
        create(&ids, IPC_PRIVATE, IpcFlags::empty(), 0).unwrap();
        assert_eq!(
            create(&ids, IPC_PRIVATE, IpcFlags::empty(), 0).unwrap_err().error(),
            Errno::ENOSPC
        );

        ids.evict(a).unwrap();
        assert!(create(&ids, IPC_PRIVATE, IpcFlags::empty(), 0).is_ok());
    }

    #[test]
    fn detached_key_creates_a_new_object() {
        let ids = IpcIds::new("test", 8);
        let first = create(&ids, 7, IpcFlags::IPC_CREAT, 1).unwrap();
        ids.detach_key(first, &owner(), 0o1000).unwrap();

        assert_eq!(ids.lookup_permission(first).unwrap().key(), IPC_PRIVATE);
        assert_eq!(ids.lookup_permission(first).unwrap().mode(), 0o1600);
        let second = create(&ids, 7, IpcFlags::IPC_CREAT, 2).unwrap();
        assert_ne!(first, second);

        ids.evict(first).unwrap();
        assert_eq!(create(&ids, 7, IpcFlags::empty(), 0).unwrap(), second);
    }
}
