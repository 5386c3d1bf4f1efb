//! ELF32 constants: record sizes, flag bits, and the small enumerations the
//! rewriter actually branches on.
//!
//! Values come from the standard ELF ABI and match the reference Python
//! ctypes definitions this tool was modeled on. Only the subset this crate's
//! Non-goals leave in scope is given enum treatment; everything else is a
//! plain integer constant, the same way the ABI itself specifies them.

use bitflags::bitflags;
use num_derive::{FromPrimitive, ToPrimitive};

/// Special section header table indices (`SHN_*`)
pub mod shn {
    /// Undefined section
    pub const UNDEF: u16 = 0;
    /// Start of reserved indices
    pub const LORESERVE: u16 = 0xff00;
    /// Associated symbol is absolute
    pub const ABS: u16 = 0xfff1;
    /// Associated symbol is common
    pub const COMMON: u16 = 0xfff2;
}

/// Section types (`sh_type` / `SHT_*`)
pub mod sht {
    /// Section header table entry unused
    pub const NULL: u32 = 0;
    /// Program data
    pub const PROGBITS: u32 = 1;
    /// Symbol table
    pub const SYMTAB: u32 = 2;
    /// String table
    pub const STRTAB: u32 = 3;
    /// Relocation entries with addends
    pub const RELA: u32 = 4;
    /// Symbol hash table
    pub const HASH: u32 = 5;
    /// Dynamic linking information
    pub const DYNAMIC: u32 = 6;
    /// Notes
    pub const NOTE: u32 = 7;
    /// Program space with no data (bss)
    pub const NOBITS: u32 = 8;
    /// Relocation entries, no addends
    pub const REL: u32 = 9;
    /// Dynamic linker symbol table
    pub const DYNSYM: u32 = 11;
    /// Processor-specific range start
    pub const LOPROC: u32 = 0x7000_0000;
    /// ARM unwind info (`SHT_LOPROC + 1`)
    pub const ARM_EXIDX: u32 = LOPROC + 1;
    /// ARM preemption map (`SHT_LOPROC + 2`)
    pub const ARM_PREEMPTMAP: u32 = LOPROC + 2;
    /// ARM build attributes (`SHT_LOPROC + 3`)
    pub const ARM_ATTRIBUTES: u32 = LOPROC + 3;
}

bitflags! {
    /// Section flags (`sh_flags` / `SHF_*`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Shf: u32 {
        /// Writable
        const WRITE = 1 << 0;
        /// Occupies memory during execution
        const ALLOC = 1 << 1;
        /// Executable
        const EXECINSTR = 1 << 2;
        /// Might be merged
        const MERGE = 1 << 4;
        /// Contains NUL-terminated strings
        const STRINGS = 1 << 5;
        /// `sh_info` holds a section index
        const INFO_LINK = 1 << 6;
        /// Preserve order after combining
        const LINK_ORDER = 1 << 7;
    }
}

bitflags! {
    /// Segment flags (`p_flags` / `PF_*`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Pf: u32 {
        /// Segment is executable
        const X = 1 << 0;
        /// Segment is writable
        const W = 1 << 1;
        /// Segment is readable
        const R = 1 << 2;
    }
}

bitflags! {
    /// `DT_FLAGS` bits (`DF_*`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Df: u32 {
        /// Object may use `DF_ORIGIN`
        const ORIGIN = 0x1;
        /// Symbol resolution starts here
        const SYMBOLIC = 0x2;
        /// Object contains text relocations
        const TEXTREL = 0x4;
        /// No lazy binding for this object
        const BIND_NOW = 0x8;
        /// Module uses the static TLS model
        const STATIC_TLS = 0x10;
    }
}

/// Segment types (`p_type` / `PT_*`)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Pt {
    /// Program header table entry unused
    Null = 0,
    /// Loadable program segment
    Load = 1,
    /// Dynamic linking information
    Dynamic = 2,
    /// Program interpreter
    Interp = 3,
    /// Auxiliary information
    Note = 4,
    /// Entry for header table itself
    Phdr = 6,
    /// OS-specific range start; used verbatim as `p_type` for the
    /// relocation-table segment, not as a semantically distinct variant
    Loos = 0x6000_0000,
}

/// Symbol binding (`ST_BIND(st_info)` / `STB_*`)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Stb {
    /// Local symbol
    Local = 0,
    /// Global symbol
    Global = 1,
    /// Weak symbol
    Weak = 2,
}

/// Symbol type (`ST_TYPE(st_info)` / `STT_*`)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Stt {
    /// Symbol type is unspecified
    NoType = 0,
    /// Symbol is a data object
    Object = 1,
    /// Symbol is a code object
    Func = 2,
    /// Symbol associated with a section
    Section = 3,
    /// Symbol's name is a file name
    File = 4,
    /// Symbol is a common data object
    Common = 5,
    /// Symbol is thread-local data object
    Tls = 6,
}

/// Symbol visibility (`ST_VISIBILITY(st_other)` / `STV_*`)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Stv {
    /// Default symbol visibility rules
    Default = 0,
    /// Processor-specific hidden class
    Internal = 1,
    /// Symbol unavailable in other modules
    Hidden = 2,
    /// Not preemptible, not exported
    Protected = 3,
}

/// Extract `ST_BIND` from a packed `st_info` byte
pub fn st_bind(info: u8) -> u8 {
    info >> 4
}

/// Extract `ST_TYPE` from a packed `st_info` byte
pub fn st_type(info: u8) -> u8 {
    info & 0xf
}

/// Pack `st_info` from a binding and a type
pub fn st_info(bind: u8, ty: u8) -> u8 {
    (bind << 4) | (ty & 0xf)
}

/// Extract `R_SYM` from a packed `r_info` word
pub fn r_sym(info: u32) -> u32 {
    info >> 8
}

/// Extract `R_TYPE` from a packed `r_info` word
pub fn r_type(info: u32) -> u32 {
    info & 0xff
}

/// Pack `r_info` from a symbol index and a relocation type
pub fn r_info(sym: u32, ty: u32) -> u32 {
    (sym << 8) | (ty & 0xff)
}

/// Dynamic section entry type (`d_tag` / `DT_*`)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Dt {
    /// Marks end of dynamic section
    Null = 0,
    /// Address of symbol hash table
    Hash = 4,
    /// Address of string table
    Strtab = 5,
    /// Address of symbol table
    Symtab = 6,
    /// Address of Rela relocs
    Rela = 7,
    /// Total size of Rela relocs
    RelaSz = 8,
    /// Size of one Rela reloc
    RelaEnt = 9,
    /// Size of string table
    StrSz = 10,
    /// Size of one symbol table entry
    SymEnt = 11,
    /// Address of init function
    Init = 12,
    /// Address of termination function
    Fini = 13,
    /// Name of shared object
    SoName = 14,
    /// Address of Rel relocs
    Rel = 17,
    /// Total size of Rel relocs
    RelSz = 18,
    /// Size of one Rel reloc
    RelEnt = 19,
    /// Flags for the object being loaded
    Flags = 30,
}

/// ARM relocation kinds this rewriter knows how to reverse-engineer
/// (`R_ARM_*`). Anything else is rejected by the policy pass.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum RArm {
    /// Direct 32 bit
    Abs32 = 2,
    /// PC relative 24 bit (Thumb32 BL)
    ThmPc22 = 10,
    /// PC relative 24 bit (Thumb32 B.W)
    ThmJump24 = 30,
    /// Program-base-relative 32 bit
    Target1 = 38,
    /// 31 bit PC relative
    Prel31 = 42,
}

impl RArm {
    /// True for the two Thumb branch-range relocation kinds
    pub fn is_thumb_branch(self) -> bool {
        matches!(self, RArm::ThmPc22 | RArm::ThmJump24)
    }
}

/// Architecture: `EM_ARM`
pub const EM_ARM: u16 = 40;
/// File type: `ET_REL`
pub const ET_REL: u16 = 1;
/// Identifier version / object version: `EV_CURRENT`
pub const EV_CURRENT: u8 = 1;

/// `EI_NIDENT`, the length of the `e_ident` byte array
pub const EI_NIDENT: usize = 16;
/// `e_ident[0..4]`, the ELF magic number
pub const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
/// `ELFCLASS32`
pub const ELFCLASS32: u8 = 1;
/// `ELFDATA2LSB`, little-endian
pub const ELFDATA2LSB: u8 = 1;

/// Base virtual/physical address of the flash (read-only, executable) region
pub const FLASH_BASE: u32 = 0x1000_0000;
/// Base virtual address of the RAM region
pub const RAM_BASE: u32 = 0x2000_0000;
/// Default alignment separating the program-header block from section
/// payloads: the flash sector / page granularity
pub const PAGE_ALIGN: u32 = 4096;

/// Round `value` up to the nearest multiple of `align` (`align == 0` means
/// no alignment is required and `value` is returned unchanged)
pub fn align_up(value: u32, align: u32) -> u32 {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}
