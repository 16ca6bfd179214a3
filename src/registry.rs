//! Process-wide index of loaded objects.
//!
//! The one piece of shared mutable state in the crate. Objects are keyed
//! by their base descriptor value; the registry slot exclusively owns the
//! object, and lookups run against a borrow held under the lock.

use std::{
    collections::BTreeMap,
    os::fd::RawFd,
    sync::Mutex,
};

use crate::object::{Object, Ready};

static OBJECTS: Mutex<BTreeMap<RawFd, Object<Ready>>> = Mutex::new(BTreeMap::new());

/// Opaque handle to a loaded object, valid until the object is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectHandle(RawFd);

impl ObjectHandle {
    /// The underlying base descriptor value.
    pub fn raw(self) -> RawFd {
        self.0
    }
}

fn lock() -> std::sync::MutexGuard<'static, BTreeMap<RawFd, Object<Ready>>> {
    OBJECTS.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn insert(obj: Object<Ready>) -> ObjectHandle {
    let handle = ObjectHandle(obj.base_fd());
    lock().insert(handle.0, obj);
    handle
}

/// Run `f` against the object behind `handle`, if it is still registered.
pub fn with<T>(handle: ObjectHandle, f: impl FnOnce(&Object<Ready>) -> T) -> Option<T> {
    lock().get(&handle.0).map(f)
}

/// Drop the object behind `handle`, releasing every descriptor and the
/// mapping. Returns whether the handle was registered.
pub fn remove(handle: ObjectHandle) -> bool {
    lock().remove(&handle.0).is_some()
}

pub fn len() -> usize {
    lock().len()
}
