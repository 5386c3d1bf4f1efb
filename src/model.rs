//! The in-memory ELF object graph.
//!
//! Nodes never borrow each other directly. Cross-references are opaque,
//! stable indices (`SectionId`, `SymbolId`) resolved against the owning
//! [`Elf`] for the duration of a single pass, per the source's dictionary of
//! typed node classes reimagined as a tagged union plus an index currency.

use std::collections::HashMap;

use crate::consts::{sht, Shf};
use crate::raw::{Dyn, Ehdr, Phdr, Rel, Rela, Shdr, Sym};

/// Stable index of a section within [`Elf::sections`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId(pub u32);

/// Stable index of a segment within [`Elf::segments`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(pub u32);

/// Stable reference to a symbol: the symtab section holding it, plus its
/// position within that symtab's entry vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub SectionId, pub u32);

/// A resolved ELF symbol table entry
#[derive(Debug, Clone)]
pub struct Symbol {
    /// Symbol value (`st_value`)
    pub value: u32,
    /// Symbol size (`st_size`)
    pub size: u32,
    /// Packed `st_info` (binding in the high nibble, type in the low nibble)
    pub info: u8,
    /// `st_other` (visibility in the low two bits)
    pub other: u8,
    /// Resolved name, looked up against the owning symtab's linked strtab
    pub name: String,
    /// Resolved section, `None` for undefined or special `SHN_*` indices
    pub section: Option<SectionId>,
    /// Raw `st_shndx` as read from (or destined for) disk; used verbatim by
    /// symbol promotion per the source's `mk_dyn` caveat (see DESIGN.md)
    pub raw_shndx: u16,
    /// Assigned during `IndexNodes`
    pub index: u32,
    /// Backref to this symbol's promoted copy in `.dynsym`, set once and
    /// memoized the first time the policy pass promotes it
    pub dyn_copy: Option<SymbolId>,
    /// `true` if loaded from the input file
    pub fixed: bool,
    /// Logical deletion mark
    pub deleted: bool,
}

impl Symbol {
    /// `ST_BIND(st_info)`
    pub fn bind(&self) -> u8 {
        crate::consts::st_bind(self.info)
    }

    /// `ST_TYPE(st_info)`
    pub fn kind(&self) -> u8 {
        crate::consts::st_type(self.info)
    }

    /// `ST_VISIBILITY(st_other)`
    pub fn visibility(&self) -> u8 {
        self.other & 0x3
    }
}

/// A relocation entry without an explicit addend (lives in an `SHT_REL` section)
#[derive(Debug, Clone)]
pub struct Relocation {
    /// `r_offset`
    pub offset: u32,
    /// Raw ARM relocation type (`R_ARM_*`)
    pub r_type: u32,
    /// Resolved target symbol
    pub symbol: SymbolId,
    /// Logical deletion mark
    pub deleted: bool,
}

/// A relocation entry with an explicit addend (lives in an `SHT_RELA` section)
#[derive(Debug, Clone)]
pub struct RelocationWithAddend {
    /// `r_offset`
    pub offset: u32,
    /// Raw ARM relocation type (`R_ARM_*`)
    pub r_type: u32,
    /// Resolved target symbol
    pub symbol: SymbolId,
    /// `r_addend`
    pub addend: i32,
    /// Logical deletion mark
    pub deleted: bool,
}

/// A late-bound or literal dynamic-entry value, replacing the source's
/// closures that capture not-yet-finalized section addresses
#[derive(Debug, Clone)]
pub enum DynValue {
    /// A fixed, already-known `d_val`
    Const(u32),
    /// Resolved against the dynamic string table at write time
    StringRef(String),
    /// `section.sh_addr`, resolved once layout is finished
    AddressOf(SectionId),
    /// `section.size()`, resolved once layout is finished
    SizeOf(SectionId),
}

/// A single `.dynamic` entry
#[derive(Debug, Clone)]
pub struct DynEntry {
    /// `d_tag`
    pub tag: i32,
    /// This entry's value
    pub value: DynValue,
}

/// ARM `.ARM.attributes` vendor subsection data the loader extracts
#[derive(Debug, Clone, Default)]
pub struct ArmAttributes {
    /// `Tag_CPU_name` (tag 5), if the "aeabi" subsection parsed cleanly
    pub cpu_name: Option<String>,
}

/// The polymorphic payload distinguishing section variants. Construction is
/// keyed off `sh_type`, mirroring the source's dictionary dispatch; the enum
/// tag takes the place of Python's class hierarchy.
#[derive(Debug, Clone)]
pub enum SectionKind {
    /// `SHT_NULL`, the reserved index-0 row
    Null,
    /// Opaque byte blob: `SHT_PROGBITS`, `SHT_NOBITS`, `SHT_NOTE`, and any
    /// `sh_type` this rewriter does not give special treatment
    Generic,
    /// `SHT_STRTAB`
    Strtab {
        /// Strings enrolled by `RegisterStrings`, in registration order
        registered: Vec<String>,
        /// Offset of each registered string once `BuildStrtabs` has run
        offsets: HashMap<String, u32>,
    },
    /// `SHT_SYMTAB` or `SHT_DYNSYM`
    Symtab(Vec<Symbol>),
    /// `SHT_REL`
    Rel(Vec<Relocation>),
    /// `SHT_RELA`
    Rela(Vec<RelocationWithAddend>),
    /// `SHT_DYNAMIC`
    Dynamic(Vec<DynEntry>),
    /// `SHT_HASH`
    Hash,
    /// `SHT_ARM_ATTRIBUTES`
    ArmAttributes(ArmAttributes),
    /// Layout placeholder reserving space for the ELF header; never written
    /// to the section header table
    EhdrPseudo,
    /// Layout placeholder reserving space for the program header table;
    /// never written to the section header table
    PhdrsPseudo,
}

/// A section node: the raw header record plus resolved cross-references and
/// variant-specific payload
#[derive(Debug, Clone)]
pub struct Section {
    /// The raw `Shdr`, kept in sync by the pipeline passes
    pub shdr: Shdr,
    /// Resolved section name
    pub name: String,
    /// Resolved `sh_link` target
    pub link: Option<SectionId>,
    /// Resolved `sh_info` target, present iff `SHF_INFO_LINK` is set
    pub info: Option<SectionId>,
    /// Raw byte payload for non-entry-bearing variants; `None` for `SHT_NOBITS`
    pub data: Option<Vec<u8>>,
    /// Physical (flash load) address, distinct from `sh_addr` when the
    /// section is writable and not `SHT_NOBITS`
    pub paddr: Option<u32>,
    /// Variant-specific payload
    pub kind: SectionKind,
    /// Index assigned by `IndexNodes`
    pub index: u32,
    /// `true` if this section (and its addresses) came from the input file
    pub fixed: bool,
    /// Logical deletion mark
    pub deleted: bool,
}

impl Section {
    /// Construct a new, non-fixed section of the given kind and name
    pub fn new(name: impl Into<String>, sh_type: u32, kind: SectionKind) -> Self {
        Self {
            shdr: Shdr {
                sh_type,
                ..Default::default()
            },
            name: name.into(),
            link: None,
            info: None,
            data: None,
            paddr: None,
            kind,
            index: 0,
            fixed: false,
            deleted: false,
        }
    }

    /// Section flags
    pub fn flags(&self) -> Shf {
        Shf::from_bits_truncate(self.shdr.sh_flags)
    }

    /// Set section flags
    pub fn set_flags(&mut self, flags: Shf) {
        self.shdr.sh_flags = flags.bits();
    }

    /// Logical size: `len(data)` when data is present, `_entries * entry_size`
    /// for entry-bearing variants, else the raw `sh_size`
    pub fn size(&self) -> u32 {
        if let Some(data) = &self.data {
            return data.len() as u32;
        }
        match &self.kind {
            SectionKind::Symtab(syms) => (syms.len() as u32) * (Sym::SIZE as u32),
            SectionKind::Rel(rels) => (rels.len() as u32) * (Rel::SIZE as u32),
            SectionKind::Rela(relas) => (relas.len() as u32) * (Rela::SIZE as u32),
            SectionKind::Dynamic(dyns) => (dyns.len() as u32) * (Dyn::SIZE as u32),
            // EhdrPseudo/PhdrsPseudo carry no entry vector or data; ComputeAddresses
            // stamps their effective size onto `shdr.sh_size` directly before the
            // generic address/offset logic runs, so they fall through here same as
            // any ordinary section.
            _ => self.shdr.sh_size,
        }
    }

    /// Physical size: bytes actually occupying file space. Zero for
    /// `SHT_NOBITS`, else equal to [`Section::size`].
    pub fn psize(&self) -> u32 {
        if self.shdr.sh_type == sht::NOBITS {
            0
        } else {
            self.size()
        }
    }

    /// Is this a `SHT_REL`/`SHT_RELA` entry-bearing variant whose entries
    /// reference symbols
    pub fn is_reloc_section(&self) -> bool {
        matches!(self.kind, SectionKind::Rel(_) | SectionKind::Rela(_))
    }
}

use crate::raw::HasWrittenSize;

/// A program segment: header plus the ordered sections it covers
#[derive(Debug, Clone)]
pub struct Segment {
    /// The raw `Phdr`, kept in sync by `ComputeSegments` for non-fixed segments
    pub phdr: Phdr,
    /// Member sections, in the order they were attached
    pub sections: Vec<SectionId>,
    /// `true` if loaded from the input file (addresses frozen)
    pub fixed: bool,
    /// Logical deletion mark
    pub deleted: bool,
}

impl Segment {
    /// Containment predicate: does this segment's address range cover `shdr`'s?
    pub fn contains(&self, shdr: &Shdr) -> bool {
        self.phdr.p_vaddr <= shdr.sh_addr
            && self.phdr.p_vaddr + self.phdr.p_memsz >= shdr.sh_addr + shdr.sh_size
    }
}

/// The root object: owns every section and segment in typed vectors
#[derive(Debug, Clone)]
pub struct Elf {
    /// The raw file header
    pub ehdr: Ehdr,
    /// All sections, in on-disk (or synthesized-append) order
    pub sections: Vec<Section>,
    /// All segments, in on-disk (or synthesized-prepend/append) order
    pub segments: Vec<Segment>,
    /// The section designated as the section-header string table
    pub shstrtab: Option<SectionId>,
}

impl Elf {
    /// Construct an `Elf` from the three mandatory header size fields. The
    /// source's constructor forwards to its base class via a typo-prone
    /// `super.__init__` call; this crate treats `Elf` as requiring only the
    /// three fixed record sizes, per the resolution recorded in DESIGN.md.
    pub fn new(ehsize: u16, phentsize: u16, shentsize: u16) -> Self {
        Self {
            ehdr: Ehdr {
                e_ident: {
                    let mut ident = [0u8; crate::consts::EI_NIDENT];
                    ident[0..4].copy_from_slice(&crate::consts::ELFMAG);
                    ident[4] = crate::consts::ELFCLASS32;
                    ident[5] = crate::consts::ELFDATA2LSB;
                    ident[6] = crate::consts::EV_CURRENT;
                    ident
                },
                e_type: crate::consts::ET_REL,
                e_machine: crate::consts::EM_ARM,
                e_version: crate::consts::EV_CURRENT as u32,
                e_entry: 0,
                e_phoff: 0,
                e_shoff: 0,
                e_flags: 0,
                e_ehsize: ehsize,
                e_phentsize: phentsize,
                e_phnum: 0,
                e_shentsize: shentsize,
                e_shnum: 0,
                e_shstrndx: 0,
            },
            sections: Vec::new(),
            segments: Vec::new(),
            shstrtab: None,
        }
    }

    /// Borrow a section by id
    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[id.0 as usize]
    }

    /// Mutably borrow a section by id
    pub fn section_mut(&mut self, id: SectionId) -> &mut Section {
        &mut self.sections[id.0 as usize]
    }

    /// Borrow a segment by id
    pub fn segment(&self, id: SegmentId) -> &Segment {
        &self.segments[id.0 as usize]
    }

    /// Mutably borrow a segment by id
    pub fn segment_mut(&mut self, id: SegmentId) -> &mut Segment {
        &mut self.segments[id.0 as usize]
    }

    /// Resolve a symbol id to its record
    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        match &self.section(id.0).kind {
            SectionKind::Symtab(syms) => &syms[id.1 as usize],
            _ => panic!("SymbolId referring to a non-symtab section"),
        }
    }

    /// Mutably resolve a symbol id to its record
    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        match &mut self.section_mut(id.0).kind {
            SectionKind::Symtab(syms) => &mut syms[id.1 as usize],
            _ => panic!("SymbolId referring to a non-symtab section"),
        }
    }

    /// Append a section, returning its freshly minted id. Ids are stable
    /// only until the next `PurgeDeleted` compaction.
    pub fn push_section(&mut self, section: Section) -> SectionId {
        let id = SectionId(self.sections.len() as u32);
        self.sections.push(section);
        id
    }

    /// Append a segment, returning its freshly minted id
    pub fn push_segment(&mut self, segment: Segment) -> SegmentId {
        let id = SegmentId(self.segments.len() as u32);
        self.segments.push(segment);
        id
    }

    /// Find a non-deleted section by exact name
    pub fn find_section(&self, name: &str) -> Option<SectionId> {
        self.sections
            .iter()
            .enumerate()
            .find(|(_, s)| !s.deleted && s.name == name)
            .map(|(i, _)| SectionId(i as u32))
    }
}
