//! Object pipeline: parse an extension image, materialize its maps, and
//! drive the two-phase kernel load.
//!
//! The pipeline is a typestate chain; each step consumes the previous
//! state, so a descriptor can only ever be released by the one owner
//! holding it and a failed step unwinds by dropping everything acquired
//! so far:
//!
//! `Object<Opened>` → `Object<Parsed>` → `Object<MapsCreated>` → `Object<Ready>`

use std::{
    collections::HashMap,
    fs::File,
    io::{self, Write},
    mem,
    os::fd::{AsFd, AsRawFd, OwnedFd, RawFd},
    path::{Path, PathBuf},
};

use log::debug;
use multimap::MultiMap;
use nom::{
    bytes::complete::take,
    number::complete::{le_u32, le_u64},
    sequence::tuple,
    IResult,
};

use crate::elf::{
    Addr, ElfError, ElfView, Rela, SectionType, SymType, R_X86_64_GLOB_DAT, R_X86_64_RELATIVE,
};
use crate::sec_defs;
use crate::sys::{BaseLoadAttrs, EntryLoadAttrs, Kernel, ProgramType, LICENSE};

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("bad input: {0}")]
    BadInput(#[from] ElfError),
    #[error("unsupported relocation type {rtype:#x} at {offset}")]
    UnsupportedRelocation { offset: Addr, rtype: u32 },
    #[error("kernel rejected {op}: {source}")]
    KernelRejected {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("scratch image error: {0}")]
    Internal(#[source] io::Error),
}

/// The fixed record an extension embeds in `.maps`, one per map. The
/// trailing `kptr` slot is all zeroes on disk; the loader patches the
/// created map's descriptor into it so the compiled extension code can
/// reach the map through the image.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MapDef {
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
    pub kptr: u64,
}

impl MapDef {
    pub const SIZE: usize = mem::size_of::<Self>();
    pub const KPTR_OFFSET: u64 = mem::offset_of!(Self, kptr) as u64;

    fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (i, (map_type, key_size, value_size, max_entries, flags)) =
            tuple((le_u32, le_u32, le_u32, le_u32, le_u32))(i)?;
        let (i, _padding) = take(4usize)(i)?;
        let (i, kptr) = le_u64(i)?;
        Ok((
            i,
            Self {
                map_type,
                key_size,
                value_size,
                max_entries,
                flags,
                kptr,
            },
        ))
    }
}

/// One map: its definition record, its in-section offset (the symbol's
/// virtual address) and, once created, the kernel descriptor.
#[derive(Debug)]
pub struct Map {
    pub name: String,
    pub offset: Addr,
    pub def: MapDef,
    fd: Option<OwnedFd>,
}

impl Map {
    pub fn fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }
}

/// Maps in symbol-enumeration order, with secondary indexes by offset
/// (relocation filtering, image patching) and by name (post-load lookup).
#[derive(Debug)]
pub struct MapTable {
    entries: Vec<Map>,
    by_offset: HashMap<Addr, usize>,
    by_name: MultiMap<String, usize>,
}

impl Default for MapTable {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            by_offset: HashMap::new(),
            by_name: MultiMap::new(),
        }
    }
}

impl MapTable {
    fn build(elf: &ElfView, symtab: usize, maps_scn: usize) -> Result<Self, LoadError> {
        let mut table = Self::default();

        let maps_sh = elf
            .section(maps_scn)
            .ok_or(ElfError::IllFormed("map section index out of range"))?
            .clone();
        let data = elf.section_data(maps_scn)?;
        let strtab = elf
            .section(symtab)
            .ok_or(ElfError::IllFormed("symbol table index out of range"))?
            .link as usize;

        let mut nr_syms = 0;
        for sym in elf.read_syms(symtab)? {
            if sym.shndx as usize != maps_scn || sym.r#type != SymType::Object {
                continue;
            }
            nr_syms += 1;

            let name = elf.strtab_str(strtab, sym.name)?.to_string();
            if crate::debug_enabled() {
                debug!(
                    "map symbol {:?}: st_value={}, st_size={}",
                    name, sym.value, sym.size
                );
            }

            // Anything in `.maps` that is not exactly one record wide is
            // some other piece of data the extension put there.
            if sym.size as usize != MapDef::SIZE {
                continue;
            }

            let start = sym
                .value
                .0
                .checked_sub(maps_sh.addr.0)
                .ok_or(ElfError::IllFormed("map definition outside its section"))?
                as usize;
            let record = start
                .checked_add(MapDef::SIZE)
                .and_then(|end| data.get(start..end))
                .ok_or(ElfError::IllFormed("map definition outside its section"))?;
            let (_, def) = MapDef::parse(record)
                .map_err(|_| ElfError::IllFormed("unreadable map definition"))?;

            if crate::debug_enabled() {
                debug!(
                    "map {:?}: type={} key_size={} value_size={} max_entries={} flags={}",
                    name, def.map_type, def.key_size, def.value_size, def.max_entries, def.flags
                );
            }

            let idx = table.entries.len();
            table.by_offset.insert(sym.value, idx);
            table.by_name.insert(name.clone(), idx);
            table.entries.push(Map {
                name,
                offset: sym.value,
                def,
                fd: None,
            });
        }

        debug!("{} symbols in \".maps\", {} map definitions", nr_syms, table.entries.len());
        Ok(table)
    }

    pub fn contains_offset(&self, offset: Addr) -> bool {
        self.by_offset.contains_key(&offset)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Map> {
        self.by_name.get(name).map(|&idx| &self.entries[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Map> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One entry point: a function symbol in a section whose name classified
/// to an attach type.
#[derive(Debug)]
pub struct Program {
    pub name: String,
    pub sec_name: String,
    pub prog_type: ProgramType,
    pub offset: Addr,
    fd: Option<OwnedFd>,
}

impl Program {
    pub fn fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }
}

#[derive(Debug)]
pub struct ProgTable {
    entries: Vec<Program>,
    by_name: MultiMap<String, usize>,
}

impl Default for ProgTable {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            by_name: MultiMap::new(),
        }
    }
}

impl ProgTable {
    fn build(elf: &ElfView, symtab: usize) -> Result<Self, LoadError> {
        let mut table = Self::default();

        let strtab = elf
            .section(symtab)
            .ok_or(ElfError::IllFormed("symbol table index out of range"))?
            .link as usize;

        for sym in elf.read_syms(symtab)? {
            if sym.r#type != SymType::Func {
                continue;
            }
            let Some(section) = elf.section(sym.shndx as usize) else {
                continue;
            };
            let sec_name = elf.section_name(section)?;
            let Some(def) = sec_defs::find_sec_def(sec_name) else {
                continue;
            };
            let name = elf.strtab_str(strtab, sym.name)?.to_string();
            if crate::debug_enabled() {
                debug!(
                    "entry point {:?} in section {:?}: {:?}, offset {}",
                    name, sec_name, def.prog_type, sym.value
                );
            }

            let idx = table.entries.len();
            table.by_name.insert(name.clone(), idx);
            table.entries.push(Program {
                name,
                sec_name: sec_name.to_string(),
                prog_type: def.prog_type,
                offset: sym.value,
                fd: None,
            });
        }

        Ok(table)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Program> {
        self.by_name.get(name).map(|&idx| &self.entries[idx])
    }

    pub fn entries(&self) -> &[Program] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A global-data fixup destined for the kernel: store the address of the
/// named symbol at `offset` in the loaded image.
#[derive(Debug, Clone)]
pub struct GlobalSym {
    pub offset: Addr,
    pub symbol: String,
}

/// The relocation plan the base load ships to the kernel. Every entry of
/// `.rela.dyn` lands in exactly one bucket: skipped (map slots, resolved
/// in-kernel during base load), `relatives`, or `globals`.
#[derive(Debug, Default)]
pub struct RelocPlan {
    pub relatives: Vec<Rela>,
    pub globals: Vec<GlobalSym>,
    pub skipped: usize,
}

impl RelocPlan {
    fn build(elf: &ElfView, sections: &Sections, maps: &MapTable) -> Result<Self, LoadError> {
        let Some(rela_scn) = sections.rela_dyn else {
            return Ok(Self::default());
        };

        let mut plan = Self::default();
        let mut dynsyms = None;

        for rela in elf.read_relas(rela_scn)? {
            if maps.contains_offset(Addr(rela.addend as u64)) {
                plan.skipped += 1;
                continue;
            }

            match rela.r_type() {
                R_X86_64_RELATIVE => plan.relatives.push(rela),
                R_X86_64_GLOB_DAT => {
                    if dynsyms.is_none() {
                        let scn = sections
                            .dynsym
                            .ok_or(ElfError::MissingSection(".dynsym"))?;
                        let strtab = elf
                            .section(scn)
                            .ok_or(ElfError::IllFormed("dynsym index out of range"))?
                            .link as usize;
                        dynsyms = Some((elf.read_syms(scn)?, strtab));
                    }
                    // just populated above
                    let (syms, strtab) = dynsyms
                        .as_ref()
                        .ok_or(ElfError::MissingSection(".dynsym"))?;
                    let sym = syms.get(rela.r_sym() as usize).ok_or(ElfError::IllFormed(
                        "dynamic symbol index out of range",
                    ))?;
                    plan.globals.push(GlobalSym {
                        offset: rela.offset,
                        symbol: elf.strtab_str(*strtab, sym.name)?.to_string(),
                    });
                }
                rtype => {
                    return Err(LoadError::UnsupportedRelocation {
                        offset: rela.offset,
                        rtype,
                    })
                }
            }
        }

        if crate::debug_enabled() {
            for rela in &plan.relatives {
                debug!("relative fixup: {}, {:#x}, {:#x}", rela.offset, rela.info, rela.addend);
            }
            for global in &plan.globals {
                debug!("global-data fixup: {}, {:?}", global.offset, global.symbol);
            }
        }
        debug!(
            "relocation plan: {} skipped (maps), {} relative, {} global-data",
            plan.skipped,
            plan.relatives.len(),
            plan.globals.len()
        );

        Ok(plan)
    }

    pub fn total(&self) -> usize {
        self.skipped + self.relatives.len() + self.globals.len()
    }
}

/// Indexes of the four sections the loader cares about. `.maps` and
/// `.rela.dyn` are optional; `.symtab` only becomes mandatory once a
/// phase actually needs it.
#[derive(Debug, Default, Clone)]
pub struct Sections {
    pub symtab: Option<usize>,
    pub dynsym: Option<usize>,
    pub maps: Option<usize>,
    pub rela_dyn: Option<usize>,
}

impl Sections {
    fn classify(elf: &ElfView) -> Result<Self, LoadError> {
        let mut sections = Self::default();

        for (idx, sh) in elf.sections().iter().enumerate() {
            let name = elf.section_name(sh)?;
            if crate::debug_enabled() {
                debug!("section {:?}, idx={}", name, idx);
            }
            match (sh.r#type, name) {
                (SectionType::SymTab, ".symtab") => sections.symtab.get_or_insert(idx),
                (SectionType::DynSym, ".dynsym") => sections.dynsym.get_or_insert(idx),
                (_, ".maps") => sections.maps.get_or_insert(idx),
                (SectionType::Rela, ".rela.dyn") => sections.rela_dyn.get_or_insert(idx),
                _ => continue,
            };
        }

        if sections.maps.is_none() {
            debug!("section .maps not found");
        }
        if sections.rela_dyn.is_none() {
            debug!("section .rela.dyn not found");
        }

        Ok(sections)
    }
}

/// An object somewhere along the load pipeline; `S` is the stage.
#[derive(Debug)]
pub struct Object<S> {
    pub state: S,
}

/// Freshly opened and mapped, nothing derived yet.
#[derive(Debug)]
pub struct Opened {
    path: PathBuf,
    name: String,
    elf: ElfView,
}

/// All tables derived, nothing touched the kernel yet.
#[derive(Debug)]
pub struct Parsed {
    path: PathBuf,
    name: String,
    elf: ElfView,
    sections: Sections,
    maps: MapTable,
    progs: ProgTable,
    plan: RelocPlan,
}

/// Kernel maps exist and their descriptors are patched into the image.
#[derive(Debug)]
pub struct MapsCreated {
    name: String,
    elf: ElfView,
    sections: Sections,
    maps: MapTable,
    progs: ProgTable,
    plan: RelocPlan,
}

/// Fully loaded. Field order matters: dropping releases program
/// descriptors, then the base descriptor, then the maps, unwinding the
/// kernel state in reverse acquisition order.
#[derive(Debug)]
pub struct Ready {
    progs: ProgTable,
    base_fd: OwnedFd,
    maps: MapTable,
    elf: ElfView,
    name: String,
}

impl Object<Opened> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "object".to_string());
        let elf = ElfView::open(path)?;
        debug!("opened {:?}, {} bytes", path, elf.image().len());

        Ok(Self {
            state: Opened {
                path: path.to_path_buf(),
                name,
                elf,
            },
        })
    }

    pub fn parse(self) -> Result<Object<Parsed>, LoadError> {
        let Opened { path, name, elf } = self.state;

        let sections = Sections::classify(&elf)?;

        let maps = match sections.maps {
            Some(maps_scn) => {
                let symtab = sections
                    .symtab
                    .ok_or(ElfError::MissingSection(".symtab"))?;
                MapTable::build(&elf, symtab, maps_scn)?
            }
            None => MapTable::default(),
        };

        let progs = match sections.symtab {
            Some(symtab) => ProgTable::build(&elf, symtab)?,
            None => ProgTable::default(),
        };

        let plan = RelocPlan::build(&elf, &sections, &maps)?;

        Ok(Object {
            state: Parsed {
                path,
                name,
                elf,
                sections,
                maps,
                progs,
                plan,
            },
        })
    }
}

impl Object<Parsed> {
    pub fn path(&self) -> &Path {
        &self.state.path
    }

    pub fn maps(&self) -> &MapTable {
        &self.state.maps
    }

    pub fn progs(&self) -> &ProgTable {
        &self.state.progs
    }

    pub fn plan(&self) -> &RelocPlan {
        &self.state.plan
    }

    /// Create every kernel map and patch its descriptor into the image,
    /// at the file position backing the record's `kptr` slot.
    pub fn create_maps<K: Kernel>(self, kernel: &K) -> Result<Object<MapsCreated>, LoadError> {
        let Parsed {
            path: _,
            name,
            mut elf,
            sections,
            mut maps,
            progs,
            plan,
        } = self.state;

        if let Some(maps_scn) = sections.maps {
            let maps_sh = elf
                .section(maps_scn)
                .ok_or(ElfError::IllFormed("map section index out of range"))?
                .clone();
            debug!(".maps section file offset={:#x}", maps_sh.offset);

            for map in &mut maps.entries {
                let fd = kernel
                    .map_create(&map.def, &map.name)
                    .map_err(|source| LoadError::KernelRejected {
                        op: "map create",
                        source,
                    })?;
                debug!("map {:?} created, fd={}", map.name, fd.as_raw_fd());

                let slot = map.offset + MapDef::KPTR_OFFSET - maps_sh.addr;
                let pos = slot.0 as usize + maps_sh.offset as usize;
                elf.patch_u64(pos, fd.as_raw_fd() as u64)?;
                map.fd = Some(fd);
            }
        }

        Ok(Object {
            state: MapsCreated {
                name,
                elf,
                sections,
                maps,
                progs,
                plan,
            },
        })
    }
}

impl Object<MapsCreated> {
    /// Drive the two-phase kernel load: snapshot the patched image, load
    /// the base object, remove the snapshot, then bind every entry point.
    ///
    /// Any failure drops the partially-built state, which closes every
    /// descriptor acquired so far and removes the scratch file.
    pub fn load<K: Kernel>(self, kernel: &K) -> Result<Object<Ready>, LoadError> {
        let MapsCreated {
            name,
            elf,
            sections: _,
            maps,
            mut progs,
            plan,
        } = self.state;

        let mut scratch = tempfile::Builder::new()
            .prefix("krill-")
            .tempfile()
            .map_err(LoadError::Internal)?;
        scratch
            .write_all(elf.image())
            .and_then(|_| scratch.flush())
            .map_err(LoadError::Internal)?;
        // The kernel only ever sees a read-only descriptor; the write
        // side closes here.
        let scratch = scratch.into_temp_path();
        let snapshot = File::open(&scratch).map_err(LoadError::Internal)?;
        debug!("snapshot written to {:?}", &*scratch);

        let map_offs: Vec<u64> = maps
            .iter()
            .map(|m| (m.offset + MapDef::KPTR_OFFSET).0)
            .collect();

        let base_fd = kernel
            .load_base(&BaseLoadAttrs {
                name: &name,
                image: &snapshot,
                license: LICENSE,
                map_offs: &map_offs,
                dyn_relas: &plan.relatives,
                dyn_syms: &plan.globals,
            })
            .map_err(|source| LoadError::KernelRejected {
                op: "base load",
                source,
            })?;
        debug!("base object loaded, fd={}", base_fd.as_raw_fd());

        // The kernel pinned the image; the snapshot has served its
        // purpose and must not linger in the temp directory.
        drop(snapshot);
        scratch.close().map_err(LoadError::Internal)?;

        for idx in 0..progs.entries.len() {
            let prog = &progs.entries[idx];
            let loaded = kernel.load_entry(&EntryLoadAttrs {
                name: &prog.name,
                prog_type: prog.prog_type,
                license: LICENSE,
                base: base_fd.as_fd(),
                offset: prog.offset,
            });
            match loaded {
                Ok(fd) => {
                    debug!("program {:?} loaded, fd={}", prog.name, fd.as_raw_fd());
                    progs.entries[idx].fd = Some(fd);
                }
                Err(source) => {
                    // Unwind in reverse acquisition order: entry points,
                    // then the base anchor, then maps (with the rest of
                    // the state).
                    drop(progs);
                    drop(base_fd);
                    return Err(LoadError::KernelRejected {
                        op: "program load",
                        source,
                    });
                }
            }
        }

        Ok(Object {
            state: Ready {
                progs,
                base_fd,
                maps,
                elf,
                name,
            },
        })
    }
}

impl Object<Ready> {
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// The kernel's anchor for the loaded image; doubles as the registry key.
    pub fn base_fd(&self) -> RawFd {
        self.state.base_fd.as_raw_fd()
    }

    pub fn prog_fd(&self, name: &str) -> Option<RawFd> {
        self.state.progs.get_by_name(name).and_then(Program::fd)
    }

    pub fn map_fd(&self, name: &str) -> Option<RawFd> {
        self.state.maps.get_by_name(name).and_then(Map::fd)
    }

    /// The neutral record attachment tooling consumes.
    pub fn view(&self) -> ObjectView {
        ObjectView {
            name: self.state.name.clone(),
            maps: self
                .state
                .maps
                .iter()
                .map(|m| MapView {
                    name: m.name.clone(),
                    fd: m.fd().unwrap_or(-1),
                })
                .collect(),
            programs: self
                .state
                .progs
                .entries()
                .iter()
                .map(|p| ProgramView {
                    name: p.name.clone(),
                    section: p.sec_name.clone(),
                    prog_type: p.prog_type,
                    fd: p.fd().unwrap_or(-1),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObjectView {
    pub name: String,
    pub maps: Vec<MapView>,
    pub programs: Vec<ProgramView>,
}

#[derive(Debug, Clone)]
pub struct MapView {
    pub name: String,
    pub fd: RawFd,
}

#[derive(Debug, Clone)]
pub struct ProgramView {
    pub name: String,
    pub section: String,
    pub prog_type: ProgramType,
    pub fd: RawFd,
}
