//! Shared test support: a byte-exact builder for synthetic extension
//! objects, and a recording kernel fake that hands out real descriptors.
#![allow(dead_code)]

use std::{
    fs::File,
    io,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    path::PathBuf,
    sync::{Mutex, MutexGuard},
};

use krill::object::MapDef;
use krill::sys::{BaseLoadAttrs, EntryLoadAttrs, Kernel, ProgramType};

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_RELA: u32 = 4;
pub const SHT_DYNSYM: u32 = 11;

pub const R_RELATIVE: u32 = 8;
pub const R_GLOB_DAT: u32 = 6;
pub const R_64: u32 = 1;

const GLOBAL_OBJECT: u8 = 0x11;
const GLOBAL_FUNC: u8 = 0x12;

/// Serialize tests that observe the process-wide loader registry.
static REGISTRY_GUARD: Mutex<()> = Mutex::new(());

pub fn registry_lock() -> MutexGuard<'static, ()> {
    REGISTRY_GUARD.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn map_def_bytes(map_type: u32, key: u32, value: u32, max: u32, flags: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(MapDef::SIZE);
    for v in [map_type, key, value, max, flags] {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(&0u64.to_le_bytes());
    out
}

struct UserSection {
    name: String,
    addr: u64,
    data: Vec<u8>,
}

struct RawSym {
    name: String,
    info: u8,
    shndx: u16,
    value: u64,
    size: u64,
}

/// Builds a minimal but structurally faithful 64-bit little-endian
/// extension object: caller-defined sections first, then `.dynsym` /
/// `.dynstr` / `.rela.dyn` as needed, then `.symtab` / `.strtab` /
/// `.shstrtab`.
pub struct ElfBuilder {
    sections: Vec<UserSection>,
    syms: Vec<RawSym>,
    dynsyms: Vec<String>,
    relas: Vec<(u64, u32, u32, i64)>,
    omit_symtab: bool,
}

impl ElfBuilder {
    pub fn new() -> Self {
        Self {
            sections: Vec::new(),
            syms: Vec::new(),
            dynsyms: Vec::new(),
            relas: Vec::new(),
            omit_symtab: false,
        }
    }

    /// Emit no `.symtab`/`.strtab` at all, for malformed-object tests.
    pub fn without_symtab(&mut self) -> &mut Self {
        self.omit_symtab = true;
        self
    }

    /// Add a PROGBITS section; returns its final section index.
    pub fn section(&mut self, name: &str, addr: u64, data: &[u8]) -> u16 {
        self.sections.push(UserSection {
            name: name.to_string(),
            addr,
            data: data.to_vec(),
        });
        self.sections.len() as u16
    }

    pub fn func(&mut self, name: &str, shndx: u16, value: u64, size: u64) {
        self.syms.push(RawSym {
            name: name.to_string(),
            info: GLOBAL_FUNC,
            shndx,
            value,
            size,
        });
    }

    pub fn object(&mut self, name: &str, shndx: u16, value: u64, size: u64) {
        self.syms.push(RawSym {
            name: name.to_string(),
            info: GLOBAL_OBJECT,
            shndx,
            value,
            size,
        });
    }

    /// Add an undefined dynamic symbol; returns its index in `.dynsym`.
    pub fn dynsym(&mut self, name: &str) -> u32 {
        self.dynsyms.push(name.to_string());
        self.dynsyms.len() as u32
    }

    pub fn rela(&mut self, offset: u64, rtype: u32, sym: u32, addend: i64) {
        self.relas.push((offset, rtype, sym, addend));
    }

    pub fn build(&self) -> Vec<u8> {
        struct FinalSection {
            name: String,
            sh_type: u32,
            addr: u64,
            data: Vec<u8>,
            link: u32,
            entsize: u64,
        }

        fn strtab(names: &[&str]) -> (Vec<u8>, Vec<u32>) {
            let mut data = vec![0u8];
            let mut offsets = Vec::new();
            for name in names {
                offsets.push(data.len() as u32);
                data.extend_from_slice(name.as_bytes());
                data.push(0);
            }
            (data, offsets)
        }

        fn symtab(syms: &[RawSym], name_offs: &[u32]) -> Vec<u8> {
            let mut data = vec![0u8; 24];
            for (sym, &name_off) in syms.iter().zip(name_offs) {
                data.extend_from_slice(&name_off.to_le_bytes());
                data.push(sym.info);
                data.push(0);
                data.extend_from_slice(&sym.shndx.to_le_bytes());
                data.extend_from_slice(&sym.value.to_le_bytes());
                data.extend_from_slice(&sym.size.to_le_bytes());
            }
            data
        }

        let mut finals = vec![FinalSection {
            name: String::new(),
            sh_type: 0,
            addr: 0,
            data: Vec::new(),
            link: 0,
            entsize: 0,
        }];

        for user in &self.sections {
            finals.push(FinalSection {
                name: user.name.clone(),
                sh_type: SHT_PROGBITS,
                addr: user.addr,
                data: user.data.clone(),
                link: 0,
                entsize: 0,
            });
        }

        let mut dynsym_idx = 0u32;
        if !self.dynsyms.is_empty() {
            let names: Vec<&str> = self.dynsyms.iter().map(String::as_str).collect();
            let (dynstr, name_offs) = strtab(&names);
            let raw: Vec<RawSym> = self
                .dynsyms
                .iter()
                .map(|name| RawSym {
                    name: name.clone(),
                    info: 0x10, // GLOBAL, NOTYPE, undefined
                    shndx: 0,
                    value: 0,
                    size: 0,
                })
                .collect();

            dynsym_idx = finals.len() as u32;
            finals.push(FinalSection {
                name: ".dynsym".to_string(),
                sh_type: SHT_DYNSYM,
                addr: 0,
                data: symtab(&raw, &name_offs),
                link: dynsym_idx + 1,
                entsize: 24,
            });
            finals.push(FinalSection {
                name: ".dynstr".to_string(),
                sh_type: SHT_STRTAB,
                addr: 0,
                data: dynstr,
                link: 0,
                entsize: 0,
            });
        }

        if !self.relas.is_empty() {
            let mut data = Vec::new();
            for &(offset, rtype, sym, addend) in &self.relas {
                data.extend_from_slice(&offset.to_le_bytes());
                data.extend_from_slice(&(((sym as u64) << 32) | rtype as u64).to_le_bytes());
                data.extend_from_slice(&addend.to_le_bytes());
            }
            finals.push(FinalSection {
                name: ".rela.dyn".to_string(),
                sh_type: SHT_RELA,
                addr: 0,
                data,
                link: dynsym_idx,
                entsize: 24,
            });
        }

        if !self.omit_symtab {
            let names: Vec<&str> = self.syms.iter().map(|s| s.name.as_str()).collect();
            let (strtab_data, name_offs) = strtab(&names);
            let symtab_idx = finals.len() as u32;
            finals.push(FinalSection {
                name: ".symtab".to_string(),
                sh_type: SHT_SYMTAB,
                addr: 0,
                data: symtab(&self.syms, &name_offs),
                link: symtab_idx + 1,
                entsize: 24,
            });
            finals.push(FinalSection {
                name: ".strtab".to_string(),
                sh_type: SHT_STRTAB,
                addr: 0,
                data: strtab_data,
                link: 0,
                entsize: 0,
            });
        }

        let shstrndx = finals.len() as u16;
        let section_names: Vec<String> = finals
            .iter()
            .map(|s| s.name.clone())
            .chain(std::iter::once(".shstrtab".to_string()))
            .collect();
        let refs: Vec<&str> = section_names.iter().map(String::as_str).collect();
        let (shstrtab_data, shname_offs) = strtab(&refs);
        finals.push(FinalSection {
            name: ".shstrtab".to_string(),
            sh_type: SHT_STRTAB,
            addr: 0,
            data: shstrtab_data,
            link: 0,
            entsize: 0,
        });

        // Lay out: ehdr, section data runs (8-aligned), header table.
        let mut offsets = vec![0u64; finals.len()];
        let mut pos = 64u64;
        for (idx, section) in finals.iter().enumerate().skip(1) {
            pos = (pos + 7) & !7;
            offsets[idx] = pos;
            pos += section.data.len() as u64;
        }
        let shoff = (pos + 7) & !7;

        let mut out = Vec::new();
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&3u16.to_le_bytes()); // ET_DYN
        out.extend_from_slice(&0x3eu16.to_le_bytes()); // EM_X86_64
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // entry
        out.extend_from_slice(&0u64.to_le_bytes()); // phoff
        out.extend_from_slice(&shoff.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // flags
        out.extend_from_slice(&64u16.to_le_bytes()); // ehsize
        out.extend_from_slice(&0u16.to_le_bytes()); // phentsize
        out.extend_from_slice(&0u16.to_le_bytes()); // phnum
        out.extend_from_slice(&64u16.to_le_bytes()); // shentsize
        out.extend_from_slice(&(finals.len() as u16).to_le_bytes());
        out.extend_from_slice(&shstrndx.to_le_bytes());

        for (idx, section) in finals.iter().enumerate().skip(1) {
            while (out.len() as u64) < offsets[idx] {
                out.push(0);
            }
            out.extend_from_slice(&section.data);
        }
        while (out.len() as u64) < shoff {
            out.push(0);
        }

        for (idx, section) in finals.iter().enumerate() {
            if idx == 0 {
                out.extend_from_slice(&[0u8; 64]);
                continue;
            }
            out.extend_from_slice(&shname_offs[idx].to_le_bytes());
            out.extend_from_slice(&section.sh_type.to_le_bytes());
            out.extend_from_slice(&2u64.to_le_bytes()); // SHF_ALLOC
            out.extend_from_slice(&section.addr.to_le_bytes());
            out.extend_from_slice(&offsets[idx].to_le_bytes());
            out.extend_from_slice(&(section.data.len() as u64).to_le_bytes());
            out.extend_from_slice(&section.link.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes()); // info
            out.extend_from_slice(&8u64.to_le_bytes()); // addralign
            out.extend_from_slice(&section.entsize.to_le_bytes());
        }

        out
    }
}

#[derive(Debug, Clone)]
pub struct MapCreateCall {
    pub name: String,
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
    pub fd: RawFd,
}

#[derive(Debug, Clone)]
pub struct BaseLoadCall {
    pub name: String,
    pub license: String,
    pub map_offs: Vec<u64>,
    pub dyn_relas: Vec<(u64, u64, i64)>,
    pub dyn_syms: Vec<(u64, String)>,
    pub snapshot_path: PathBuf,
    pub image: Vec<u8>,
    pub fd: RawFd,
}

#[derive(Debug, Clone)]
pub struct EntryLoadCall {
    pub name: String,
    pub prog_type: ProgramType,
    pub base_fd: RawFd,
    pub offset: u64,
    pub fd: RawFd,
}

#[derive(Default)]
struct FakeState {
    map_creates: Vec<MapCreateCall>,
    base_loads: Vec<BaseLoadCall>,
    entry_loads: Vec<EntryLoadCall>,
    snapshots: Vec<PathBuf>,
    entry_attempts: usize,
}

/// A stand-in for the kernel side of the load protocol. Descriptors are
/// duplicated from `/dev/null`, so they are real, unique, and closeable.
pub struct FakeKernel {
    state: Mutex<FakeState>,
    fail_map_create: bool,
    fail_base: bool,
    fail_entry_at: Option<usize>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            fail_map_create: false,
            fail_base: false,
            fail_entry_at: None,
        }
    }

    pub fn failing_map_create() -> Self {
        Self {
            fail_map_create: true,
            ..Self::new()
        }
    }

    pub fn failing_base() -> Self {
        Self {
            fail_base: true,
            ..Self::new()
        }
    }

    /// Fail the n-th (zero-based) per-program load.
    pub fn failing_entry(n: usize) -> Self {
        Self {
            fail_entry_at: Some(n),
            ..Self::new()
        }
    }

    pub fn map_creates(&self) -> Vec<MapCreateCall> {
        self.state.lock().unwrap().map_creates.clone()
    }

    pub fn base_loads(&self) -> Vec<BaseLoadCall> {
        self.state.lock().unwrap().base_loads.clone()
    }

    pub fn entry_loads(&self) -> Vec<EntryLoadCall> {
        self.state.lock().unwrap().entry_loads.clone()
    }

    /// Every snapshot path a base load was attempted with, failures included.
    pub fn snapshots(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().snapshots.clone()
    }

    fn issue_fd() -> io::Result<OwnedFd> {
        Ok(OwnedFd::from(File::open("/dev/null")?))
    }

    fn rejected() -> io::Error {
        io::Error::from_raw_os_error(22) // EINVAL
    }
}

impl Kernel for FakeKernel {
    fn map_create(&self, def: &MapDef, name: &str) -> io::Result<OwnedFd> {
        if self.fail_map_create {
            return Err(Self::rejected());
        }
        let fd = Self::issue_fd()?;
        self.state.lock().unwrap().map_creates.push(MapCreateCall {
            name: name.to_string(),
            map_type: def.map_type,
            key_size: def.key_size,
            value_size: def.value_size,
            max_entries: def.max_entries,
            flags: def.flags,
            fd: fd.as_raw_fd(),
        });
        Ok(fd)
    }

    fn load_base(&self, attrs: &BaseLoadAttrs<'_>) -> io::Result<OwnedFd> {
        let snapshot_path =
            std::fs::read_link(format!("/proc/self/fd/{}", attrs.image.as_raw_fd()))?;
        let image = std::fs::read(&snapshot_path)?;
        self.state.lock().unwrap().snapshots.push(snapshot_path.clone());
        if self.fail_base {
            return Err(Self::rejected());
        }
        let fd = Self::issue_fd()?;
        self.state.lock().unwrap().base_loads.push(BaseLoadCall {
            name: attrs.name.to_string(),
            license: attrs.license.to_string_lossy().into_owned(),
            map_offs: attrs.map_offs.to_vec(),
            dyn_relas: attrs
                .dyn_relas
                .iter()
                .map(|r| (r.offset.0, r.info, r.addend))
                .collect(),
            dyn_syms: attrs
                .dyn_syms
                .iter()
                .map(|s| (s.offset.0, s.symbol.clone()))
                .collect(),
            snapshot_path,
            image,
            fd: fd.as_raw_fd(),
        });
        Ok(fd)
    }

    fn load_entry(&self, attrs: &EntryLoadAttrs<'_>) -> io::Result<OwnedFd> {
        let mut state = self.state.lock().unwrap();
        let attempt = state.entry_attempts;
        state.entry_attempts += 1;
        if self.fail_entry_at == Some(attempt) {
            return Err(Self::rejected());
        }
        let fd = Self::issue_fd()?;
        state.entry_loads.push(EntryLoadCall {
            name: attrs.name.to_string(),
            prog_type: attrs.prog_type,
            base_fd: attrs.base.as_raw_fd(),
            offset: attrs.offset.0,
            fd: fd.as_raw_fd(),
        });
        Ok(fd)
    }
}
