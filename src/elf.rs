//! Minimal 64-bit little-endian ELF reader backed by a private file mapping.
//!
//! Covers exactly what the loader needs: section headers, symbol tables,
//! string tables and relocation-with-addend entries. The file is mapped
//! `PROT_READ|PROT_WRITE` with `MAP_PRIVATE` semantics, so writes (map
//! descriptor patching) stay in-process and never reach the backing file.

use std::{
    fmt, fs,
    ops::{Add, Sub},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    slice,
};

use custom_debug_derive::Debug as CustomDebug;
use enumflags2::{bitflags, BitFlags};
use mmap::{MapOption, MemoryMap};
use nom::{
    bytes::complete::{tag, take},
    multi::count,
    number::complete::{le_i64, le_u16, le_u32, le_u64, u8 as any_u8},
    sequence::tuple,
    IResult,
};

/// x86-64 PIE-relative fixup: add the load address to the stored addend.
pub const R_X86_64_RELATIVE: u32 = 8;
/// x86-64 global-data fixup: store the address of a named symbol.
pub const R_X86_64_GLOB_DAT: u32 = 6;

const MAGIC: &[u8] = &[0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EM_X86_64: u16 = 0x3e;

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
pub const SYM_SIZE: usize = 24;
pub const RELA_SIZE: usize = 24;

#[derive(thiserror::Error, Debug)]
pub enum ElfError {
    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("object could not be mapped in memory: {0}")]
    Map(#[from] mmap::MapError),
    #[error("object could not be parsed: {0}")]
    Parse(String),
    #[error("not a 64-bit little-endian x86-64 object")]
    WrongFormat,
    #[error("section {0} missing")]
    MissingSection(&'static str),
    #[error("ill-formed object: {0}")]
    IllFormed(&'static str),
}

/// A virtual address (or in-section offset) inside the object.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Addr(pub u64);

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Add<u64> for Addr {
    type Output = Self;
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl Sub<Addr> for Addr {
    type Output = Self;
    fn sub(self, rhs: Addr) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl From<u64> for Addr {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl From<Addr> for u64 {
    fn from(a: Addr) -> Self {
        a.0
    }
}

impl From<Addr> for usize {
    fn from(a: Addr) -> Self {
        a.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionType {
    Null,
    ProgBits,
    SymTab,
    StrTab,
    Rela,
    NoBits,
    DynSym,
    Other(u32),
}

impl From<u32> for SectionType {
    fn from(v: u32) -> Self {
        match v {
            0 => Self::Null,
            1 => Self::ProgBits,
            2 => Self::SymTab,
            3 => Self::StrTab,
            4 => Self::Rela,
            8 => Self::NoBits,
            11 => Self::DynSym,
            o => Self::Other(o),
        }
    }
}

#[bitflags]
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionFlag {
    Write = 1,
    Alloc = 2,
    ExecInstr = 4,
}

#[derive(Debug, Clone)]
pub struct SectionHeader {
    pub name: u32,
    pub r#type: SectionType,
    pub flags: BitFlags<SectionFlag>,
    pub addr: Addr,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub info: u32,
    pub addralign: u64,
    pub entsize: u64,
}

impl SectionHeader {
    fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (i, (name, r#type, flags, addr, offset, size, link, info, addralign, entsize)) =
            tuple((
                le_u32, le_u32, le_u64, le_u64, le_u64, le_u64, le_u32, le_u32, le_u64, le_u64,
            ))(i)?;
        Ok((
            i,
            Self {
                name,
                r#type: r#type.into(),
                flags: BitFlags::from_bits_truncate(flags),
                addr: addr.into(),
                offset,
                size,
                link,
                info,
                addralign,
                entsize,
            },
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymType {
    NoType,
    Object,
    Func,
    Section,
    File,
    Other(u8),
}

impl From<u8> for SymType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::NoType,
            1 => Self::Object,
            2 => Self::Func,
            3 => Self::Section,
            4 => Self::File,
            o => Self::Other(o),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sym {
    pub name: u32,
    pub r#type: SymType,
    pub bind: u8,
    pub shndx: u16,
    pub value: Addr,
    pub size: u64,
}

impl Sym {
    fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (i, (name, info, _other, shndx, value, size)) =
            tuple((le_u32, any_u8, any_u8, le_u16, le_u64, le_u64))(i)?;
        Ok((
            i,
            Self {
                name,
                r#type: (info & 0xf).into(),
                bind: info >> 4,
                shndx,
                value: value.into(),
                size,
            },
        ))
    }
}

/// A relocation-with-addend record. `#[repr(C)]` matches the on-disk
/// `Elf64_Rela` layout, so slices of these are handed to the kernel
/// verbatim as the PIE-relative fixup array.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Rela {
    pub offset: Addr,
    pub info: u64,
    pub addend: i64,
}

impl Rela {
    fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (i, (offset, info, addend)) = tuple((le_u64, le_u64, le_i64))(i)?;
        Ok((
            i,
            Self {
                offset: offset.into(),
                info,
                addend,
            },
        ))
    }

    pub fn r_type(&self) -> u32 {
        (self.info & 0xffff_ffff) as u32
    }

    pub fn r_sym(&self) -> u32 {
        (self.info >> 32) as u32
    }
}

/// Exclusive owner of the private, writable mapping of the object file.
pub struct Image {
    map: MemoryMap,
    len: usize,
}

// `MemoryMap` holds a raw pointer and so is neither Send nor Sync on its
// own. The mapping is exclusively owned by this struct and only reachable
// through `&self`/`&mut self`, which restores the usual aliasing rules.
unsafe impl Send for Image {}
unsafe impl Sync for Image {}

impl Image {
    fn new(file: &fs::File, len: usize) -> Result<Self, mmap::MapError> {
        let map = MemoryMap::new(
            len,
            &[
                MapOption::MapReadable,
                MapOption::MapWritable,
                MapOption::MapFd(file.as_raw_fd()),
            ],
        )?;
        Ok(Self { map, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.map.data(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.map.data(), self.len) }
    }
}

/// An opened object: the private mapping plus its parsed section table.
#[derive(CustomDebug)]
pub struct ElfView {
    pub path: PathBuf,
    #[debug(skip)]
    image: Image,
    shstrndx: u16,
    sections: Vec<SectionHeader>,
}

struct Ehdr {
    shoff: u64,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

impl Ehdr {
    fn parse(i: &[u8]) -> IResult<&[u8], (u8, u8, u16, Self)> {
        let (i, _) = tag(MAGIC)(i)?;
        let (i, (class, data, _version)) = tuple((any_u8, any_u8, any_u8))(i)?;
        let (i, _padding) = take(9usize)(i)?;
        let (i, (_type, machine, _version)) = tuple((le_u16, le_u16, le_u32))(i)?;
        let (i, (_entry, _phoff, shoff)) = tuple((le_u64, le_u64, le_u64))(i)?;
        let (i, (_flags, _ehsize, _phentsize, _phnum)) =
            tuple((le_u32, le_u16, le_u16, le_u16))(i)?;
        let (i, (shentsize, shnum, shstrndx)) = tuple((le_u16, le_u16, le_u16))(i)?;
        Ok((
            i,
            (
                class,
                data,
                machine,
                Self {
                    shoff,
                    shentsize,
                    shnum,
                    shstrndx,
                },
            ),
        ))
    }
}

impl ElfView {
    pub fn open(path: &Path) -> Result<Self, ElfError> {
        let io_err = |e| ElfError::Io(path.to_path_buf(), e);
        let file = fs::File::open(path).map_err(io_err)?;
        let len = file.metadata().map_err(io_err)?.len() as usize;
        if len < EHDR_SIZE {
            return Err(ElfError::Parse(format!("{} is too short", path.display())));
        }

        let image = Image::new(&file, len)?;

        let (_, (class, data, machine, ehdr)) = Ehdr::parse(image.as_slice())
            .map_err(|_| ElfError::Parse(format!("{} has no valid ELF header", path.display())))?;

        if class != ELFCLASS64 || data != ELFDATA2LSB || machine != EM_X86_64 {
            return Err(ElfError::WrongFormat);
        }

        let shnum = ehdr.shnum as usize;
        if shnum > 0 && ehdr.shentsize as usize != SHDR_SIZE {
            return Err(ElfError::IllFormed("unexpected section header size"));
        }
        let table_end = (ehdr.shoff as usize).checked_add(shnum * SHDR_SIZE);
        let table = match table_end {
            Some(end) if end <= len => &image.as_slice()[ehdr.shoff as usize..end],
            _ => return Err(ElfError::IllFormed("section header table out of bounds")),
        };

        let (_, sections) = count(SectionHeader::parse, shnum)(table)
            .map_err(|_| ElfError::IllFormed("unreadable section header table"))?;

        Ok(Self {
            path: path.to_path_buf(),
            image,
            shstrndx: ehdr.shstrndx,
            sections,
        })
    }

    pub fn sections(&self) -> &[SectionHeader] {
        &self.sections
    }

    pub fn section(&self, idx: usize) -> Option<&SectionHeader> {
        self.sections.get(idx)
    }

    /// Raw bytes of the whole (patched) image.
    pub fn image(&self) -> &[u8] {
        self.image.as_slice()
    }

    /// Write an 8-byte little-endian value into the image at a file offset.
    pub fn patch_u64(&mut self, pos: usize, value: u64) -> Result<(), ElfError> {
        let bytes = self.image.as_mut_slice();
        let slot = pos
            .checked_add(8)
            .and_then(|end| bytes.get_mut(pos..end))
            .ok_or(ElfError::IllFormed("patch position out of bounds"))?;
        slot.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Data of section `idx`, bounds-checked against the mapping.
    pub fn section_data(&self, idx: usize) -> Result<&[u8], ElfError> {
        let sh = self
            .section(idx)
            .ok_or(ElfError::IllFormed("section index out of range"))?;
        if matches!(sh.r#type, SectionType::Null | SectionType::NoBits) {
            return Ok(&[]);
        }
        let start = sh.offset as usize;
        start
            .checked_add(sh.size as usize)
            .and_then(|end| self.image.as_slice().get(start..end))
            .ok_or(ElfError::IllFormed("section data out of bounds"))
    }

    /// Name of a section, resolved through the section-name string table.
    pub fn section_name(&self, sh: &SectionHeader) -> Result<&str, ElfError> {
        self.strtab_str(self.shstrndx as usize, sh.name)
    }

    /// NUL-terminated string at `off` inside string-table section `scn`.
    pub fn strtab_str(&self, scn: usize, off: u32) -> Result<&str, ElfError> {
        let data = self.section_data(scn)?;
        let tail = data
            .get(off as usize..)
            .ok_or(ElfError::IllFormed("string offset past string table"))?;
        let end = tail
            .iter()
            .position(|&c| c == 0)
            .ok_or(ElfError::IllFormed("unterminated string table entry"))?;
        std::str::from_utf8(&tail[..end])
            .map_err(|_| ElfError::IllFormed("non-UTF-8 string table entry"))
    }

    /// All symbols of a symbol-table section.
    pub fn read_syms(&self, scn: usize) -> Result<Vec<Sym>, ElfError> {
        let data = self.section_data(scn)?;
        if data.len() % SYM_SIZE != 0 {
            return Err(ElfError::IllFormed("symbol table size not a multiple of 24"));
        }
        let (_, syms) = count(Sym::parse, data.len() / SYM_SIZE)(data)
            .map_err(|_| ElfError::IllFormed("unreadable symbol table"))?;
        Ok(syms)
    }

    /// All relocation entries of a relocation-with-addend section.
    pub fn read_relas(&self, scn: usize) -> Result<Vec<Rela>, ElfError> {
        let data = self.section_data(scn)?;
        if data.len() % RELA_SIZE != 0 {
            return Err(ElfError::IllFormed("relocation section size not a multiple of 24"));
        }
        let (_, relas) = count(Rela::parse, data.len() / RELA_SIZE)(data)
            .map_err(|_| ElfError::IllFormed("unreadable relocation section"))?;
        Ok(relas)
    }
}
