//! Wire-level kernel interface.
//!
//! The loader talks to the kernel through three commands of the extension
//! syscall: the stock map-create, plus the two commands the extension
//! runtime adds on top, a whole-image base load and a per-entry-point
//! program load. All three take the same attribute union,
//! zero-initialized, with only the relevant arm populated.

use std::{
    ffi::CStr,
    fs::File,
    io, mem,
    os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
};

use crate::elf::{Addr, Rela};
use crate::object::{GlobalSym, MapDef};

pub const BPF_MAP_CREATE: u32 = 0;
/// Registers the whole image and resolves relocations in-kernel.
pub const BPF_PROG_LOAD_BASE: u32 = 0x1234_beef;
/// Binds one function of an already-loaded image to an attach point.
pub const BPF_PROG_LOAD_ENTRY: u32 = 0x1234_bef0;

/// Kernel bound on object names, terminator included.
pub const OBJ_NAME_LEN: usize = 16;

/// The license string passed on every program load.
pub const LICENSE: &CStr = c"GPL";

/// Attach-type tag carried by every program entry, and the `prog_type`
/// value of the load commands. Values past the stock set are understood
/// only by the extension runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProgramType {
    Kprobe = 2,
    SchedCls = 3,
    Tracepoint = 5,
    Xdp = 6,
    PerfEvent = 7,
    /// The whole-image anchor program of a base load.
    Base = 64,
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct MapCreateAttr {
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
    pub map_name: [u8; OBJ_NAME_LEN],
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct ProgLoadAttr {
    pub prog_type: u32,
    pub prog_name: [u8; OBJ_NAME_LEN],
    pub image_fd: i32,
    pub license: u64,
    pub map_offs: u64,
    pub map_cnt: u32,
    pub dyn_relas: u64,
    pub nr_dyn_relas: u32,
    pub dyn_syms: u64,
    pub nr_dyn_syms: u32,
    pub base_prog_fd: i32,
    pub prog_offset: u64,
}

/// 16-byte global-data fixup record as the kernel reads it.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct DynSymRecord {
    pub offset: u64,
    pub symbol: u64,
}

#[repr(C)]
pub union BpfAttr {
    pub map_create: MapCreateAttr,
    pub prog_load: ProgLoadAttr,
    _pad: [u8; 128],
}

/// Copy a name into a fixed wire field, keeping the final NUL intact.
pub fn bounded_name(name: &str) -> [u8; OBJ_NAME_LEN] {
    let mut buf = [0u8; OBJ_NAME_LEN];
    let n = name.len().min(OBJ_NAME_LEN - 1);
    buf[..n].copy_from_slice(&name.as_bytes()[..n]);
    buf
}

/// Everything the base load carries besides the command itself.
pub struct BaseLoadAttrs<'a> {
    pub name: &'a str,
    /// Read-only descriptor to the patched on-disk snapshot.
    pub image: &'a File,
    pub license: &'static CStr,
    /// File offsets of each map's kernel-handle slot, in map order.
    pub map_offs: &'a [u64],
    pub dyn_relas: &'a [Rela],
    pub dyn_syms: &'a [GlobalSym],
}

/// Everything a per-entry-point load carries.
pub struct EntryLoadAttrs<'a> {
    pub name: &'a str,
    pub prog_type: ProgramType,
    pub license: &'static CStr,
    pub base: BorrowedFd<'a>,
    pub offset: Addr,
}

/// The kernel boundary. Production code goes through [`Syscall`]; tests
/// substitute a recording fake.
pub trait Kernel {
    fn map_create(&self, def: &MapDef, name: &str) -> io::Result<OwnedFd>;
    fn load_base(&self, attrs: &BaseLoadAttrs<'_>) -> io::Result<OwnedFd>;
    fn load_entry(&self, attrs: &EntryLoadAttrs<'_>) -> io::Result<OwnedFd>;
}

/// Issues the real extension syscall.
pub struct Syscall;

unsafe fn bpf(cmd: u32, attr: &mut BpfAttr) -> libc::c_long {
    libc::syscall(
        libc::SYS_bpf,
        cmd as libc::c_long,
        attr as *mut BpfAttr,
        mem::size_of::<BpfAttr>() as libc::c_uint,
    )
}

fn fd_from_ret(ret: libc::c_long) -> io::Result<OwnedFd> {
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })
}

impl Kernel for Syscall {
    fn map_create(&self, def: &MapDef, name: &str) -> io::Result<OwnedFd> {
        let mut attr: BpfAttr = unsafe { mem::zeroed() };
        attr.map_create = MapCreateAttr {
            map_type: def.map_type,
            key_size: def.key_size,
            value_size: def.value_size,
            max_entries: def.max_entries,
            map_flags: def.flags,
            map_name: bounded_name(name),
        };
        fd_from_ret(unsafe { bpf(BPF_MAP_CREATE, &mut attr) })
    }

    fn load_base(&self, attrs: &BaseLoadAttrs<'_>) -> io::Result<OwnedFd> {
        // The kernel reads the symbol names as C strings; the buffers must
        // outlive the syscall, hence the two locals below.
        let names = attrs
            .dyn_syms
            .iter()
            .map(|s| {
                std::ffi::CString::new(s.symbol.as_str())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
            })
            .collect::<io::Result<Vec<_>>>()?;
        let records: Vec<DynSymRecord> = attrs
            .dyn_syms
            .iter()
            .zip(&names)
            .map(|(s, name)| DynSymRecord {
                offset: s.offset.0,
                symbol: name.as_ptr() as u64,
            })
            .collect();

        let mut attr: BpfAttr = unsafe { mem::zeroed() };
        attr.prog_load = ProgLoadAttr {
            prog_type: ProgramType::Base as u32,
            prog_name: bounded_name(attrs.name),
            image_fd: attrs.image.as_raw_fd(),
            license: attrs.license.as_ptr() as u64,
            map_offs: attrs.map_offs.as_ptr() as u64,
            map_cnt: attrs.map_offs.len() as u32,
            dyn_relas: attrs.dyn_relas.as_ptr() as u64,
            nr_dyn_relas: attrs.dyn_relas.len() as u32,
            dyn_syms: records.as_ptr() as u64,
            nr_dyn_syms: records.len() as u32,
            base_prog_fd: -1,
            prog_offset: 0,
        };
        fd_from_ret(unsafe { bpf(BPF_PROG_LOAD_BASE, &mut attr) })
    }

    fn load_entry(&self, attrs: &EntryLoadAttrs<'_>) -> io::Result<OwnedFd> {
        let mut attr: BpfAttr = unsafe { mem::zeroed() };
        attr.prog_load = ProgLoadAttr {
            prog_type: attrs.prog_type as u32,
            prog_name: bounded_name(attrs.name),
            image_fd: -1,
            license: attrs.license.as_ptr() as u64,
            map_offs: 0,
            map_cnt: 0,
            dyn_relas: 0,
            nr_dyn_relas: 0,
            dyn_syms: 0,
            nr_dyn_syms: 0,
            base_prog_fd: attrs.base.as_raw_fd(),
            prog_offset: attrs.offset.0,
        };
        fd_from_ret(unsafe { bpf(BPF_PROG_LOAD_ENTRY, &mut attr) })
    }
}
