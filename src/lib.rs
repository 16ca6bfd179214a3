//! Userspace loader for ahead-of-time compiled kernel extensions.
//!
//! An extension crate compiles to a position-independent ELF object that
//! embeds map definitions in a `.maps` section and announces its entry
//! points through the names of the sections its functions live in. This
//! crate opens such an object, creates the kernel maps it declares,
//! patches their descriptors into a private mapping of the image, plans
//! the PIE and global-data relocations the kernel will apply, and drives
//! the two-phase load: one base load that pins the whole image, then one
//! program load per entry point.
//!
//! ```no_run
//! let handle = krill::load_object("extension.o").unwrap();
//! let prog = krill::prog_fd(handle, "handle_tp").unwrap();
//! let map = krill::map_fd(handle, "events").unwrap();
//! # let _ = (prog, map);
//! ```

use std::{
    os::fd::RawFd,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

pub mod elf;
pub mod object;
pub mod registry;
pub mod sec_defs;
pub mod sys;

pub use object::{LoadError, MapView, Object, ObjectView, ProgramView};
pub use registry::ObjectHandle;
pub use sys::{Kernel, ProgramType, Syscall};

static DEBUG: AtomicBool = AtomicBool::new(false);

/// Toggle verbose parse/load diagnostics.
pub fn set_debug(enabled: bool) {
    DEBUG.store(enabled, Ordering::SeqCst);
    log::info!(
        "loader debug output {}",
        if enabled { "enabled" } else { "disabled" }
    );
}

pub(crate) fn debug_enabled() -> bool {
    DEBUG.load(Ordering::SeqCst)
}

/// Run the whole pipeline against an explicit kernel implementation and
/// register the result. This is the seam tests drive with a fake kernel.
pub fn load_object_with<K: Kernel>(
    path: impl AsRef<Path>,
    kernel: &K,
) -> Result<ObjectHandle, LoadError> {
    let obj = Object::open(path.as_ref())?
        .parse()?
        .create_maps(kernel)?
        .load(kernel)?;
    Ok(registry::insert(obj))
}

/// Load an object from a filesystem path. On any failure the diagnostic
/// is logged and the result is `None`; already-loaded objects are never
/// affected.
pub fn load_object(path: impl AsRef<Path>) -> Option<ObjectHandle> {
    let path = path.as_ref();
    match load_object_with(path, &Syscall) {
        Ok(handle) => Some(handle),
        Err(e) => {
            log::error!("failed to load {}: {}", path.display(), e);
            None
        }
    }
}

/// Descriptor of a loaded program by name, or `None` when the handle or
/// the name is unknown.
pub fn prog_fd(handle: ObjectHandle, name: &str) -> Option<RawFd> {
    registry::with(handle, |obj| obj.prog_fd(name)).flatten()
}

/// Descriptor of a created map by name, or `None` when the handle or the
/// name is unknown.
pub fn map_fd(handle: ObjectHandle, name: &str) -> Option<RawFd> {
    registry::with(handle, |obj| obj.map_fd(name)).flatten()
}

/// The full post-load record for attachment tooling.
pub fn object_view(handle: ObjectHandle) -> Option<ObjectView> {
    registry::with(handle, |obj| obj.view())
}

/// Unregister an object and release everything it owns.
pub fn close_object(handle: ObjectHandle) -> bool {
    registry::remove(handle)
}
