//! Reads an input byte stream into an object graph: header -> segments ->
//! sections (phase 1), then section payload / entry data (phase 2, "ReadData"),
//! then cross-reference resolution (phase 3, "Dereference"). Mirrors
//! `elf.py`'s `load()` + `ReadData` + `Dereference` visitors.

use std::collections::HashMap;
use std::io::Cursor;

use crate::consts::{shn, sht, Shf};
use crate::error::{Error, Result};
use crate::model::{
    ArmAttributes, DynEntry, DynValue, Elf, Relocation, RelocationWithAddend, Section, SectionId,
    SectionKind, Segment, Symbol, SymbolId,
};
use crate::raw::{Dyn, Ehdr, FromReader, HasWrittenSize, Phdr, Rel, Rela, Shdr, Sym};
use crate::strtab;

/// Headers and raw payload for one on-disk section, prior to cross-reference
/// resolution. Intermediate state between the header-read phase and
/// `Dereference`.
struct RawSection {
    shdr: Shdr,
    data: Option<Vec<u8>>,
    syms: Option<Vec<Sym>>,
    rels: Option<Vec<Rel>>,
    relas: Option<Vec<Rela>>,
    dyns: Option<Vec<Dyn>>,
    cpu_name: Option<String>,
}

/// Load and fully dereference an ELF object from an in-memory byte buffer
pub fn load(bytes: &[u8]) -> Result<Elf> {
    let mut cursor = Cursor::new(bytes);

    let ehdr = Ehdr::from_reader(&mut cursor)?;
    if ehdr.e_ehsize as usize != Ehdr::SIZE {
        return Err(Error::InvalidHeaderField {
            field: "e_ehsize",
            value: ehdr.e_ehsize as u32,
        });
    }
    if ehdr.e_phentsize as usize != Phdr::SIZE {
        return Err(Error::InvalidHeaderField {
            field: "e_phentsize",
            value: ehdr.e_phentsize as u32,
        });
    }
    if ehdr.e_shentsize as usize != Shdr::SIZE {
        return Err(Error::InvalidHeaderField {
            field: "e_shentsize",
            value: ehdr.e_shentsize as u32,
        });
    }

    cursor.set_position(ehdr.e_phoff as u64);
    let mut raw_phdrs = Vec::with_capacity(ehdr.e_phnum as usize);
    for _ in 0..ehdr.e_phnum {
        raw_phdrs.push(Phdr::from_reader(&mut cursor)?);
    }

    cursor.set_position(ehdr.e_shoff as u64);
    let mut shdrs = Vec::with_capacity(ehdr.e_shnum as usize);
    for _ in 0..ehdr.e_shnum {
        shdrs.push(Shdr::from_reader(&mut cursor)?);
    }

    let shstrndx = ehdr.e_shstrndx as usize;
    if shstrndx >= shdrs.len() {
        return Err(Error::SectionIndexOutOfRange {
            index: shstrndx as u32,
            count: shdrs.len(),
        });
    }

    let raw_sections = read_data(bytes, &shdrs)?;
    let shstrtab_data = raw_sections[shstrndx]
        .data
        .as_deref()
        .ok_or(Error::InvalidHeaderField {
            field: "e_shstrndx",
            value: shstrndx as u32,
        })?;

    let sections = dereference_sections(&raw_sections, shstrtab_data)?;
    let segments = dereference_segments(&raw_phdrs, &shdrs);

    Ok(Elf {
        ehdr,
        sections,
        segments,
        shstrtab: Some(SectionId(shstrndx as u32)),
    })
}

/// Phase 2: read each section's raw payload or entry array ("ReadData")
fn read_data(bytes: &[u8], shdrs: &[Shdr]) -> Result<Vec<RawSection>> {
    let mut out = Vec::with_capacity(shdrs.len());
    for shdr in shdrs {
        let mut raw = RawSection {
            shdr: *shdr,
            data: None,
            syms: None,
            rels: None,
            relas: None,
            dyns: None,
            cpu_name: None,
        };

        match shdr.sh_type {
            sht::SYMTAB | sht::DYNSYM => {
                raw.syms = Some(read_entries::<Sym>(bytes, shdr)?);
            }
            sht::REL => {
                raw.rels = Some(read_entries::<Rel>(bytes, shdr)?);
            }
            sht::RELA => {
                raw.relas = Some(read_entries::<Rela>(bytes, shdr)?);
            }
            sht::DYNAMIC => {
                raw.dyns = Some(read_entries::<Dyn>(bytes, shdr)?);
            }
            sht::NOBITS | sht::NULL => {}
            _ => {
                let data = read_bytes(bytes, shdr)?;
                if shdr.sh_type == sht::ARM_ATTRIBUTES {
                    raw.cpu_name = parse_arm_attributes(&data);
                }
                raw.data = Some(data);
            }
        }
        out.push(raw);
    }
    Ok(out)
}

fn read_bytes(bytes: &[u8], shdr: &Shdr) -> Result<Vec<u8>> {
    let start = shdr.sh_offset as usize;
    let end = start + shdr.sh_size as usize;
    bytes
        .get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or(Error::InvalidHeaderField {
            field: "sh_offset",
            value: shdr.sh_offset,
        })
}

fn read_entries<T: FromReader + HasWrittenSize>(bytes: &[u8], shdr: &Shdr) -> Result<Vec<T>> {
    if shdr.sh_entsize == 0 {
        return Ok(Vec::new());
    }
    let count = (shdr.sh_size / shdr.sh_entsize) as usize;
    let mut cursor = Cursor::new(bytes);
    cursor.set_position(shdr.sh_offset as u64);
    (0..count).map(|_| T::from_reader(&mut cursor)).collect()
}

/// Decode the "aeabi" vendor subsection of an `.ARM.attributes` section to
/// extract `Tag_CPU_name` (tag 5). Any mismatch in the expected grammar
/// yields `None` rather than an error, matching the source.
fn parse_arm_attributes(data: &[u8]) -> Option<String> {
    if data.is_empty() || data[0] != 0x41 {
        return None;
    }
    let data = &data[1..];

    let size = u32::from_le_bytes(data.get(0..4)?.try_into().ok()?) as usize;
    let data = data.get(4..size)?;

    let nul = data.iter().position(|&b| b == 0)?;
    if &data[..nul] != b"aeabi" {
        return None;
    }
    let data = data.get(nul + 1..)?;

    if data.first() != Some(&1) {
        return None;
    }
    let data = &data[1..];

    let size = u32::from_le_bytes(data.get(0..4)?.try_into().ok()?) as usize;
    let data = data.get(4..size)?;

    if data.first() != Some(&5) {
        return None;
    }
    let data = &data[1..];

    let nul = data.iter().position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&data[..nul]).into_owned())
}

/// Phase 3 (sections half of "Dereference"): resolve names, link/info, and
/// entry-level symbol/section references
fn dereference_sections(raw_sections: &[RawSection], shstrtab_data: &[u8]) -> Result<Vec<Section>> {
    let count = raw_sections.len();
    let mut out = Vec::with_capacity(count);

    for raw in raw_sections {
        let shdr = raw.shdr;
        let name = if shdr.sh_name == 0 {
            String::new()
        } else {
            strtab::lookup(shstrtab_data, shdr.sh_name)?
        };

        let link_idx = shdr.sh_link as usize;
        if link_idx >= count {
            return Err(Error::SectionIndexOutOfRange {
                index: shdr.sh_link,
                count,
            });
        }
        let link = Some(SectionId(link_idx as u32));

        let info = if Shf::from_bits_truncate(shdr.sh_flags).contains(Shf::INFO_LINK) {
            let info_idx = shdr.sh_info as usize;
            if info_idx >= count {
                return Err(Error::SectionIndexOutOfRange {
                    index: shdr.sh_info,
                    count,
                });
            }
            Some(SectionId(info_idx as u32))
        } else {
            None
        };

        let kind = match shdr.sh_type {
            sht::NULL => SectionKind::Null,
            sht::STRTAB => SectionKind::Strtab {
                registered: Vec::new(),
                offsets: HashMap::new(),
            },
            sht::SYMTAB | sht::DYNSYM => {
                let strtab_data = raw_sections[link_idx].data.as_deref().unwrap_or(&[]);
                let syms = raw
                    .syms
                    .as_ref()
                    .expect("SYMTAB/DYNSYM always has entries read")
                    .iter()
                    .map(|sym| build_symbol(sym, strtab_data, count))
                    .collect::<Result<Vec<_>>>()?;
                SectionKind::Symtab(syms)
            }
            sht::REL => {
                let rels = raw
                    .rels
                    .as_ref()
                    .expect("REL always has entries read")
                    .iter()
                    .map(|rel| {
                        let sym_idx = crate::consts::r_sym(rel.r_info);
                        Relocation {
                            offset: rel.r_offset,
                            r_type: crate::consts::r_type(rel.r_info),
                            symbol: SymbolId(SectionId(link_idx as u32), sym_idx),
                            deleted: false,
                        }
                    })
                    .collect();
                SectionKind::Rel(rels)
            }
            sht::RELA => {
                let relas = raw
                    .relas
                    .as_ref()
                    .expect("RELA always has entries read")
                    .iter()
                    .map(|rela| {
                        let sym_idx = crate::consts::r_sym(rela.r_info);
                        RelocationWithAddend {
                            offset: rela.r_offset,
                            r_type: crate::consts::r_type(rela.r_info),
                            symbol: SymbolId(SectionId(link_idx as u32), sym_idx),
                            addend: rela.r_addend,
                            deleted: false,
                        }
                    })
                    .collect();
                SectionKind::Rela(relas)
            }
            sht::DYNAMIC => {
                let dyns = raw
                    .dyns
                    .as_ref()
                    .expect("DYNAMIC always has entries read")
                    .iter()
                    .map(|d| DynEntry {
                        tag: d.d_tag,
                        value: DynValue::Const(d.d_un),
                    })
                    .collect();
                SectionKind::Dynamic(dyns)
            }
            sht::HASH => SectionKind::Hash,
            sht::ARM_ATTRIBUTES => SectionKind::ArmAttributes(ArmAttributes {
                cpu_name: raw.cpu_name.clone(),
            }),
            _ => SectionKind::Generic,
        };

        let data = match &kind {
            SectionKind::Generic | SectionKind::Strtab { .. } | SectionKind::ArmAttributes(_) => {
                raw.data.clone()
            }
            _ => None,
        };

        out.push(Section {
            shdr,
            name,
            link,
            info,
            data,
            paddr: None,
            kind,
            index: 0,
            fixed: true,
            deleted: false,
        });
    }

    Ok(out)
}

fn build_symbol(sym: &Sym, strtab_data: &[u8], section_count: usize) -> Result<Symbol> {
    let name = if sym.st_name == 0 {
        String::new()
    } else {
        strtab::lookup(strtab_data, sym.st_name)?
    };
    let section = if sym.st_shndx > shn::UNDEF && (sym.st_shndx as usize) < shn::LORESERVE as usize
    {
        if sym.st_shndx as usize >= section_count {
            return Err(Error::SectionIndexOutOfRange {
                index: sym.st_shndx as u32,
                count: section_count,
            });
        }
        Some(SectionId(sym.st_shndx as u32))
    } else {
        None
    };
    Ok(Symbol {
        value: sym.st_value,
        size: sym.st_size,
        info: sym.st_info,
        other: sym.st_other,
        name,
        section,
        raw_shndx: sym.st_shndx,
        index: 0,
        dyn_copy: None,
        fixed: true,
        deleted: false,
    })
}

/// Phase 3 (segments half of "Dereference"): derive each segment's member
/// sections by the containment predicate, using the raw on-disk addresses
fn dereference_segments(raw_phdrs: &[Phdr], shdrs: &[Shdr]) -> Vec<Segment> {
    raw_phdrs
        .iter()
        .map(|phdr| {
            let sections = shdrs
                .iter()
                .enumerate()
                .filter(|(_, shdr)| {
                    phdr.p_vaddr <= shdr.sh_addr
                        && phdr.p_vaddr + phdr.p_memsz >= shdr.sh_addr + shdr.sh_size
                })
                .map(|(i, _)| SectionId(i as u32))
                .collect();
            Segment {
                phdr: *phdr,
                sections,
                fixed: true,
                deleted: false,
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::raw::ToWriter;

    fn minimal_elf() -> Vec<u8> {
        let mut ehdr = crate::model::Elf::new(Ehdr::SIZE as u16, Phdr::SIZE as u16, Shdr::SIZE as u16).ehdr;
        ehdr.e_shoff = Ehdr::SIZE as u32;
        ehdr.e_shnum = 2;
        ehdr.e_shstrndx = 1;

        let mut buf = Vec::new();
        ehdr.to_writer(&mut buf).unwrap();

        let null_shdr = Shdr::default();
        let shstrtab_data = b"\0.shstrtab\0";
        let shstrtab_shdr = Shdr {
            sh_name: 1,
            sh_type: sht::STRTAB,
            sh_offset: (Ehdr::SIZE + 2 * Shdr::SIZE) as u32,
            sh_size: shstrtab_data.len() as u32,
            ..Default::default()
        };
        null_shdr.to_writer(&mut buf).unwrap();
        shstrtab_shdr.to_writer(&mut buf).unwrap();
        buf.extend_from_slice(shstrtab_data);
        buf
    }

    #[test]
    fn loads_minimal_two_section_object() {
        let bytes = minimal_elf();
        let elf = load(&bytes).unwrap();
        assert_eq!(elf.sections.len(), 2);
        assert_eq!(elf.sections[1].name, ".shstrtab");
        assert!(matches!(elf.sections[1].kind, SectionKind::Strtab { .. }));
    }

    #[test]
    fn arm_attributes_with_no_aeabi_subsection_yields_no_cpu_name() {
        assert_eq!(parse_arm_attributes(&[]), None);
        assert_eq!(parse_arm_attributes(&[0x41]), None);
    }
}
