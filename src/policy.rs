//! The rewriter's actual policy: turns a plain relocatable ARM object into a
//! dynamically-loadable extension module. Everything here runs once, after
//! loading and before the generic layout passes in [`crate::pipeline`], with
//! one exception ([`finalize_footer`]) that needs the layout passes' output.
//!
//! `.ehdr` is deliberately never constructed here even though
//! [`crate::model::SectionKind::EhdrPseudo`] exists as a variant: the source
//! this crate is modeled on builds such a pseudo-section but never attaches
//! it to the section list either. See DESIGN.md.

use std::collections::HashMap;

use crate::config::{cpu_config, Config, CpuConfig};
use crate::consts::{shn, sht, Df, Dt, Pt, RArm, Shf, Stb, Stt, Stv};
use crate::error::{Error, Result};
use crate::model::{
    ArmAttributes, DynEntry, DynValue, Elf, RelocationWithAddend, Section, SectionId,
    SectionKind, Segment, Symbol, SymbolId,
};
use crate::raw::{Dyn, HasWrittenSize, Phdr, Rel, Rela, Sym};

/// Ids of every section this pass synthesizes, threaded through the
/// remaining steps instead of repeated name lookups.
struct DynSections {
    dynstr: SectionId,
    dynsym: SectionId,
    dynhash: SectionId,
    dynrela: SectionId,
    dynrel: SectionId,
    dynamic: SectionId,
    phdrs: SectionId,
    interp: SectionId,
    footer: SectionId,
}

/// Run the full policy pass: preprocessing, synthesis, symbol promotion,
/// veneer synthesis, relocation conversion, dynamic-entry construction, and
/// segment planning. Call [`crate::pipeline::run`] next, then
/// [`finalize_footer`], then [`crate::pipeline::write`].
pub fn apply(elf: &mut Elf, config: &Config) -> Result<()> {
    let cpu = preprocess(elf, config)?;
    let ds = build_dynamic_sections(elf, config);
    promote_symbols(elf, cpu, ds.dynsym, ds.dynrela)?;
    convert_relocations(elf, ds.dynsym, ds.dynrela)?;
    build_hash_skeleton(elf, ds.dynhash, ds.dynsym);
    build_dynamic_entries(elf, config, &ds);
    build_segment_plan(elf, &ds);
    Ok(())
}

/// Strip debug sections, force `.data*`/`.uninitialized_data*` flags, and
/// find the input's CPU name, resolving it against the per-CPU table.
fn preprocess(elf: &mut Elf, config: &Config) -> Result<CpuConfig> {
    let mut cpu_name: Option<String> = None;

    for section in elf.sections.iter_mut() {
        if config.strip && section.name.starts_with(".debug") {
            section.deleted = true;
        }
        if section.name.starts_with(".data") {
            let mut flags = section.flags();
            flags.insert(Shf::WRITE);
            section.set_flags(flags);
        }
        if section.name.starts_with(".uninitialized_data") {
            let mut flags = section.flags();
            flags.insert(Shf::ALLOC);
            section.set_flags(flags);
        }
        if section.name.starts_with(".ARM.attributes") {
            if let SectionKind::ArmAttributes(ArmAttributes { cpu_name: name }) = &section.kind {
                cpu_name = name.clone();
            }
        }
    }

    crate::pipeline::purge_deleted(elf);

    let cpu_name = cpu_name.ok_or(Error::MissingCpuName)?;
    cpu_config(&cpu_name).ok_or(Error::UnsupportedCpu { cpu: cpu_name })
}

fn null_symbol() -> Symbol {
    Symbol {
        value: 0,
        size: 0,
        info: 0,
        other: 0,
        name: String::new(),
        section: None,
        raw_shndx: shn::UNDEF,
        index: 0,
        dyn_copy: None,
        fixed: false,
        deleted: false,
    }
}

/// Construct `.dynstr`, `.dynsym`, `.hash`, `.rela.dyn`, `.rel.dyn`,
/// `.dynamic`, the `.phdrs` pseudo-section, `.interp`, and `.footer`, in the
/// exact order the rewritten file lists them in.
fn build_dynamic_sections(elf: &mut Elf, config: &Config) -> DynSections {
    let mut phdrs = Section::new(".phdrs", sht::PROGBITS, SectionKind::PhdrsPseudo);
    phdrs.shdr.sh_addralign = 4;
    phdrs.set_flags(Shf::ALLOC);

    let mut dynamic = Section::new(".dynamic", sht::DYNAMIC, SectionKind::Dynamic(Vec::new()));
    dynamic.shdr.sh_addralign = 4;
    dynamic.shdr.sh_entsize = Dyn::SIZE as u32;
    dynamic.set_flags(Shf::ALLOC);

    let mut dynhash = Section::new(".hash", sht::HASH, SectionKind::Hash);
    dynhash.shdr.sh_addralign = 4;
    dynhash.set_flags(Shf::ALLOC);

    let mut dynstr = Section::new(
        ".dynstr",
        sht::STRTAB,
        SectionKind::Strtab {
            registered: Vec::new(),
            offsets: HashMap::new(),
        },
    );
    dynstr.shdr.sh_addralign = 1;
    dynstr.set_flags(Shf::ALLOC);

    let mut dynsym = Section::new(".dynsym", sht::DYNSYM, SectionKind::Symtab(vec![null_symbol()]));
    dynsym.shdr.sh_addralign = 4;
    dynsym.shdr.sh_entsize = Sym::SIZE as u32;
    dynsym.set_flags(Shf::ALLOC);

    let mut interp = Section::new(".interp", sht::PROGBITS, SectionKind::Generic);
    interp.shdr.sh_addralign = 1;
    interp.set_flags(Shf::ALLOC);
    interp.data = Some(config.interp.clone().into_bytes());

    let mut dynrela = Section::new(".rela.dyn", sht::RELA, SectionKind::Rela(Vec::new()));
    dynrela.shdr.sh_addralign = 4;
    dynrela.shdr.sh_entsize = Rela::SIZE as u32;
    dynrela.set_flags(Shf::ALLOC);

    let mut dynrel = Section::new(".rel.dyn", sht::REL, SectionKind::Rel(Vec::new()));
    dynrel.shdr.sh_addralign = 4;
    dynrel.shdr.sh_entsize = Rel::SIZE as u32;
    dynrel.set_flags(Shf::ALLOC);

    let mut footer = Section::new(".footer", sht::PROGBITS, SectionKind::Generic);
    footer.shdr.sh_addralign = 256;
    footer.shdr.sh_size = 8;
    footer.set_flags(Shf::ALLOC);

    let phdrs_id = elf.push_section(phdrs);
    let dynamic_id = elf.push_section(dynamic);
    let dynhash_id = elf.push_section(dynhash);
    let dynstr_id = elf.push_section(dynstr);
    let dynsym_id = elf.push_section(dynsym);
    let interp_id = elf.push_section(interp);
    let dynrela_id = elf.push_section(dynrela);
    let dynrel_id = elf.push_section(dynrel);
    let footer_id = elf.push_section(footer);

    elf.section_mut(dynamic_id).link = Some(dynstr_id);
    elf.section_mut(dynhash_id).link = Some(dynsym_id);
    elf.section_mut(dynsym_id).link = Some(dynstr_id);
    elf.section_mut(dynrela_id).link = Some(dynsym_id);
    elf.section_mut(dynrela_id).info = None;
    elf.section_mut(dynrel_id).link = Some(dynsym_id);
    elf.section_mut(dynrel_id).info = None;

    DynSections {
        dynstr: dynstr_id,
        dynsym: dynsym_id,
        dynhash: dynhash_id,
        dynrela: dynrela_id,
        dynrel: dynrel_id,
        dynamic: dynamic_id,
        phdrs: phdrs_id,
        interp: interp_id,
        footer: footer_id,
    }
}

/// Copy a symbol into `.dynsym`, memoizing the copy on the source symbol so
/// later passes referring to the same symbol reuse one dynamic entry.
fn mk_dyn(elf: &mut Elf, sym_id: SymbolId, dynsym: SectionId) -> SymbolId {
    if let Some(existing) = elf.symbol(sym_id).dyn_copy {
        return existing;
    }

    let sym = elf.symbol(sym_id).clone();
    let copy = Symbol {
        value: sym.value,
        size: sym.size,
        info: sym.info,
        other: sym.other,
        name: sym.name,
        section: sym.section,
        raw_shndx: if sym.section.is_some() {
            sym.raw_shndx
        } else {
            shn::UNDEF
        },
        index: 0,
        dyn_copy: None,
        fixed: false,
        deleted: false,
    };

    let new_id = match &mut elf.section_mut(dynsym).kind {
        SectionKind::Symtab(syms) => {
            let idx = syms.len() as u32;
            syms.push(copy);
            SymbolId(dynsym, idx)
        }
        _ => unreachable!("dynsym is always a Symtab section"),
    };
    elf.symbol_mut(sym_id).dyn_copy = Some(new_id);
    new_id
}

/// Promote every defined, non-local, default-visibility symbol in every
/// input `SHT_SYMTAB` into `.dynsym`, and synthesize the extra `ABS32`
/// relocation GCC's `-q` veneers need but never emit themselves.
fn promote_symbols(
    elf: &mut Elf,
    cpu: CpuConfig,
    dynsym: SectionId,
    dynrela: SectionId,
) -> Result<()> {
    let symtab_ids: Vec<SectionId> = elf
        .sections
        .iter()
        .enumerate()
        .filter(|(_, s)| s.shdr.sh_type == sht::SYMTAB)
        .map(|(i, _)| SectionId(i as u32))
        .collect();

    for symtab_id in symtab_ids {
        let count = match &elf.section(symtab_id).kind {
            SectionKind::Symtab(syms) => syms.len(),
            _ => 0,
        };

        for idx in 0..count {
            let sym_id = SymbolId(symtab_id, idx as u32);
            let sym = elf.symbol(sym_id).clone();
            if sym.section.is_none() {
                continue;
            }

            if sym.bind() != Stb::Local as u8 && sym.visibility() == Stv::Default as u8 {
                mk_dyn(elf, sym_id, dynsym);
            }

            if sym.name.starts_with("__") && sym.name.ends_with("_veneer") {
                synthesize_veneer(elf, symtab_id, sym_id, &sym, cpu, dynsym, dynrela)?;
            }
        }
    }

    Ok(())
}

/// `__<X>_veneer` symbols carry a literal pointer at a CPU-specific offset
/// into their own body; find the real target symbol that pointer matches and
/// record an `ABS32` relocation against it so the dynamic linker patches the
/// veneer's trampoline the same way it would patch an ordinary reference.
fn synthesize_veneer(
    elf: &mut Elf,
    symtab_id: SectionId,
    sym_id: SymbolId,
    sym: &Symbol,
    cpu: CpuConfig,
    dynsym: SectionId,
    dynrela: SectionId,
) -> Result<()> {
    let section_id = sym.section.expect("caller only calls on defined symbols");
    let sh_addr = elf.section(section_id).shdr.sh_addr;

    if cpu.veneer_symbol_offset.wrapping_add(4) > sym.size {
        return Err(Error::TruncatedVeneer {
            name: sym.name.clone(),
            size: sym.size,
            offset: cpu.veneer_symbol_offset,
        });
    }

    let r_offset = (sym.value & !1u32).wrapping_add(cpu.veneer_symbol_offset);
    let file_offset = (r_offset - sh_addr) as usize;
    let real_sym_value = {
        let data = elf
            .section(section_id)
            .data
            .as_ref()
            .expect("a defined, sized veneer symbol's section carries data");
        u32::from_le_bytes(
            data[file_offset..file_offset + 4]
                .try_into()
                .expect("4-byte slice"),
        )
    };

    let real_sym_name = &sym.name[2..sym.name.len() - 7];
    let target = match &elf.section(symtab_id).kind {
        SectionKind::Symtab(syms) => syms
            .iter()
            .enumerate()
            .find(|(_, s)| s.name == real_sym_name && s.value == real_sym_value)
            .map(|(i, _)| SymbolId(symtab_id, i as u32)),
        _ => None,
    };
    let Some(target_id) = target else {
        return Err(Error::MissingVeneerTarget {
            name: real_sym_name.to_string(),
        });
    };

    let dyn_target = mk_dyn(elf, target_id, dynsym);
    if let SectionKind::Rela(relocs) = &mut elf.section_mut(dynrela).kind {
        relocs.push(RelocationWithAddend {
            offset: r_offset,
            r_type: RArm::Abs32 as u32,
            symbol: dyn_target,
            addend: 0,
            deleted: false,
        });
    }
    Ok(())
}

fn is_supported_reloc(r_type: u32) -> bool {
    r_type == RArm::Abs32 as u32
        || r_type == RArm::Target1 as u32
        || r_type == RArm::ThmPc22 as u32
        || r_type == RArm::ThmJump24 as u32
        || r_type == RArm::Prel31 as u32
}

/// Reverse-engineer the link-time relocations a plain `.o` carries into the
/// build-time-resolved-but-not-yet-finally-placed form a Thumb `-q` object
/// has: read back what the linker baked into each instruction, then decide
/// whether it still needs a dynamic relocation or was already fully resolved
/// in place.
fn decode_addend(r_type: u32, insn: u32) -> i64 {
    if r_type == RArm::Abs32 as u32 || r_type == RArm::Target1 as u32 {
        insn as i64
    } else if r_type == RArm::Prel31 as u32 {
        let mut v = (insn & 0x7FFF_FFFF) as i64;
        if v & 0x4000_0000 != 0 {
            v -= 0x8000_0000;
        }
        v
    } else {
        // ThmPc22 / ThmJump24
        let mut v = (((insn & 0x7FF) << 11) | ((insn & 0x07FF_0000) >> 16)) as i64;
        if v & 0x0020_0000 != 0 {
            v -= 0x0040_0000;
        }
        v * 2
    }
}

fn undo_relocation(r_type: u32, s: u32, p: u32, a: i64) -> i64 {
    if r_type == RArm::Abs32 as u32 || r_type == RArm::Target1 as u32 {
        a - s as i64
    } else {
        let s_even = (s & !1u32) as i64;
        a - (s_even - p as i64)
    }
}

/// Convert every input `SHT_REL` section into entries appended to
/// `.rela.dyn`, then delete the input section: on this target, relocations
/// live only in the synthesized dynamic table, never as link-time records.
fn convert_relocations(elf: &mut Elf, dynsym: SectionId, dynrela: SectionId) -> Result<()> {
    let rel_ids: Vec<SectionId> = elf
        .sections
        .iter()
        .enumerate()
        .filter(|(_, s)| s.shdr.sh_type == sht::REL)
        .map(|(i, _)| SectionId(i as u32))
        .collect();

    for rel_id in rel_ids {
        let info_id = elf.section(rel_id).info;
        let info_alloc = info_id.is_some_and(|id| elf.section(id).flags().contains(Shf::ALLOC));
        if !info_alloc {
            elf.section_mut(rel_id).deleted = true;
            continue;
        }
        let info_id = info_id.expect("checked above");
        let link_id = elf.section(rel_id).link;

        let relocs = match &elf.section(rel_id).kind {
            SectionKind::Rel(rels) => rels.clone(),
            _ => unreachable!("filtered to SHT_REL above"),
        };

        for rel in &relocs {
            let sym = elf.symbol(rel.symbol).clone();
            if sym.raw_shndx == shn::UNDEF {
                continue;
            }

            let is_thumb_branch =
                rel.r_type == RArm::ThmPc22 as u32 || rel.r_type == RArm::ThmJump24 as u32;

            let mut sym_id = rel.symbol;
            let mut sym = sym;
            if is_thumb_branch && (sym.value >> 28) != (rel.offset >> 28) {
                let veneer_name = format!("__{}_veneer", sym.name);
                let link = link_id.expect("REL sections always link a symtab");
                let veneer = match &elf.section(link).kind {
                    SectionKind::Symtab(syms) => syms
                        .iter()
                        .enumerate()
                        .find(|(_, s)| s.name == veneer_name)
                        .map(|(i, _)| SymbolId(link, i as u32)),
                    _ => None,
                };
                let Some(veneer_id) = veneer else {
                    return Err(Error::MissingVeneer {
                        offset: rel.offset,
                        name: veneer_name,
                    });
                };
                sym_id = veneer_id;
                sym = elf.symbol(sym_id).clone();
            }

            if !is_supported_reloc(rel.r_type) {
                let symbol = if sym.kind() == Stt::Section as u8 {
                    sym.section
                        .map(|s| elf.section(s).name.clone())
                        .unwrap_or_default()
                } else {
                    sym.name.clone()
                };
                return Err(Error::UnsupportedRelocationType {
                    r_type: rel.r_type,
                    symbol,
                    section: elf.section(rel_id).name.clone(),
                });
            }

            let target_sh_addr = elf.section(info_id).shdr.sh_addr;
            let file_offset = (rel.offset - target_sh_addr) as usize;
            let insn = {
                let data = elf
                    .section(info_id)
                    .data
                    .as_ref()
                    .expect("an ALLOC relocation target carries data");
                u32::from_le_bytes(
                    data[file_offset..file_offset + 4]
                        .try_into()
                        .expect("4-byte slice"),
                )
            };
            let decoded = decode_addend(rel.r_type, insn);
            let addend = undo_relocation(rel.r_type, sym.value, rel.offset, decoded);

            if sym.section.is_some() {
                if rel.r_type == RArm::Abs32 as u32 || rel.r_type == RArm::Target1 as u32 {
                    let target = mk_dyn(elf, sym_id, dynsym);
                    push_rela(elf, dynrela, rel.offset, rel.r_type, target, addend as i32);
                } else {
                    debug_assert_eq!(
                        sym.value >> 28,
                        rel.offset >> 28,
                        "in-bank Thumb branch/PREL31 resolved to a cross-bank symbol"
                    );
                }
            } else {
                if is_thumb_branch && decoded.unsigned_abs() >= 0x0040_0000 {
                    return Err(Error::BranchRangeOverflow { addend: decoded });
                }
                let target = mk_dyn(elf, sym_id, dynsym);
                push_rela(elf, dynrela, rel.offset, rel.r_type, target, addend as i32);
            }
        }

        elf.section_mut(rel_id).deleted = true;
    }

    Ok(())
}

fn push_rela(elf: &mut Elf, dynrela: SectionId, offset: u32, r_type: u32, symbol: SymbolId, addend: i32) {
    if let SectionKind::Rela(relocs) = &mut elf.section_mut(dynrela).kind {
        relocs.push(RelocationWithAddend {
            offset,
            r_type,
            symbol,
            addend,
            deleted: false,
        });
    }
}

/// Stamp `.hash`'s minimal skeleton: no real buckets, just a chain long
/// enough to cover every promoted dynamic symbol. Must run after every
/// promotion pass (symbol promotion, veneers, relocation conversion) since
/// they all still append to `.dynsym`.
fn build_hash_skeleton(elf: &mut Elf, dynhash: SectionId, dynsym: SectionId) {
    let nchain = match &elf.section(dynsym).kind {
        SectionKind::Symtab(syms) => syms.len() as u32,
        _ => 0,
    };
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(&nchain.to_le_bytes());
    elf.section_mut(dynhash).data = Some(data);
}

fn push_dyn(elf: &mut Elf, dynamic: SectionId, tag: Dt, value: DynValue) {
    if let SectionKind::Dynamic(entries) = &mut elf.section_mut(dynamic).kind {
        entries.push(DynEntry {
            tag: tag as i32,
            value,
        });
    }
}

fn find_dynsym(elf: &Elf, dynsym: SectionId, name: &str) -> Option<SymbolId> {
    match &elf.section(dynsym).kind {
        SectionKind::Symtab(syms) => syms
            .iter()
            .enumerate()
            .find(|(_, s)| s.name == name)
            .map(|(i, _)| SymbolId(dynsym, i as u32)),
        _ => None,
    }
}

/// Append `.dynamic`'s entries in the exact order a loader walking this
/// table would expect to see them grouped: hash/strtab/symtab, the Rela
/// group (only if non-empty), strsz/syment/soname, the Rel group (only if
/// non-empty), flags, then the optional entry points and caller-supplied
/// `--entry` pairs, terminated by `DT_NULL`.
fn build_dynamic_entries(elf: &mut Elf, config: &Config, ds: &DynSections) {
    push_dyn(elf, ds.dynamic, Dt::Hash, DynValue::AddressOf(ds.dynhash));
    push_dyn(elf, ds.dynamic, Dt::Strtab, DynValue::AddressOf(ds.dynstr));
    push_dyn(elf, ds.dynamic, Dt::Symtab, DynValue::AddressOf(ds.dynsym));

    let rela_nonempty = matches!(&elf.section(ds.dynrela).kind, SectionKind::Rela(r) if !r.is_empty());
    if rela_nonempty {
        push_dyn(elf, ds.dynamic, Dt::Rela, DynValue::AddressOf(ds.dynrela));
        push_dyn(elf, ds.dynamic, Dt::RelaEnt, DynValue::Const(Rela::SIZE as u32));
        push_dyn(elf, ds.dynamic, Dt::RelaSz, DynValue::SizeOf(ds.dynrela));
    }

    push_dyn(elf, ds.dynamic, Dt::StrSz, DynValue::SizeOf(ds.dynstr));
    push_dyn(elf, ds.dynamic, Dt::SymEnt, DynValue::Const(Sym::SIZE as u32));
    push_dyn(
        elf,
        ds.dynamic,
        Dt::SoName,
        DynValue::StringRef(config.soname.clone()),
    );

    let rel_nonempty = matches!(&elf.section(ds.dynrel).kind, SectionKind::Rel(r) if !r.is_empty());
    if rel_nonempty {
        push_dyn(elf, ds.dynamic, Dt::Rel, DynValue::AddressOf(ds.dynrel));
        push_dyn(elf, ds.dynamic, Dt::RelEnt, DynValue::Const(Rel::SIZE as u32));
        push_dyn(elf, ds.dynamic, Dt::RelSz, DynValue::SizeOf(ds.dynrel));
    }

    push_dyn(
        elf,
        ds.dynamic,
        Dt::Flags,
        DynValue::Const((Df::BIND_NOW | Df::TEXTREL).bits()),
    );

    if let Some(init) = find_dynsym(elf, ds.dynsym, "__dl_init") {
        let value = elf.symbol(init).value;
        push_dyn(elf, ds.dynamic, Dt::Init, DynValue::Const(value));
    }
    if let Some(fini) = find_dynsym(elf, ds.dynsym, "__dl_fini") {
        let value = elf.symbol(fini).value;
        push_dyn(elf, ds.dynamic, Dt::Fini, DynValue::Const(value));
    }
    for entry in &config.entries {
        if let Some(sym_id) = find_dynsym(elf, ds.dynsym, &entry.symbol) {
            let value = elf.symbol(sym_id).value;
            if let SectionKind::Dynamic(entries) = &mut elf.section_mut(ds.dynamic).kind {
                entries.push(DynEntry {
                    tag: entry.tag as i32,
                    value: DynValue::Const(value),
                });
            }
        }
    }

    push_dyn(elf, ds.dynamic, Dt::Null, DynValue::Const(0));
}

fn load_segment(sections: Vec<SectionId>) -> Segment {
    Segment {
        phdr: Phdr {
            p_type: Pt::Load as u32,
            ..Default::default()
        },
        sections,
        fixed: false,
        deleted: false,
    }
}

/// Prepend `PT_PHDR`/`PT_INTERP` ahead of whatever segments the input
/// carried, then append the segments covering every synthesized section.
fn build_segment_plan(elf: &mut Elf, ds: &DynSections) {
    let phdrs_segment = Segment {
        phdr: Phdr {
            p_type: Pt::Phdr as u32,
            ..Default::default()
        },
        sections: vec![ds.phdrs],
        fixed: false,
        deleted: false,
    };
    let interp_segment = Segment {
        phdr: Phdr {
            p_type: Pt::Interp as u32,
            ..Default::default()
        },
        sections: vec![ds.interp],
        fixed: false,
        deleted: false,
    };
    elf.segments.splice(0..0, [phdrs_segment, interp_segment]);

    let dynamic_segment = Segment {
        phdr: Phdr {
            p_type: Pt::Dynamic as u32,
            ..Default::default()
        },
        sections: vec![ds.dynamic],
        fixed: false,
        deleted: false,
    };
    let loos_segment = Segment {
        phdr: Phdr {
            p_type: Pt::Loos as u32,
            ..Default::default()
        },
        sections: vec![ds.dynrela, ds.dynrel],
        fixed: false,
        deleted: false,
    };

    elf.segments.push(load_segment(vec![ds.phdrs]));
    elf.segments.push(dynamic_segment);
    elf.segments.push(load_segment(vec![
        ds.dynamic,
        ds.dynhash,
        ds.dynstr,
        ds.dynsym,
        ds.interp,
        ds.dynrela,
        ds.dynrel,
    ]));
    elf.segments.push(loos_segment);
    elf.segments.push(load_segment(vec![ds.footer]));
}

/// Stamp `.footer`'s 8-byte signature from `.phdrs`'s resolved physical
/// address. Must run after [`crate::pipeline::run`] (specifically
/// `compute_addresses`) and before [`crate::pipeline::write`].
pub fn finalize_footer(elf: &mut Elf) {
    let phdrs_id = elf
        .find_section(".phdrs")
        .expect("policy::apply always creates .phdrs");
    let phdr_addr = elf
        .section(phdrs_id)
        .paddr
        .expect("compute_addresses assigns paddr to every ALLOC section");
    let footer_id = elf
        .find_section(".footer")
        .expect("policy::apply always creates .footer");

    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&phdr_addr.to_le_bytes());
    data.extend_from_slice(&(!phdr_addr).to_le_bytes());
    elf.section_mut(footer_id).data = Some(data);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::raw::{Ehdr, Shdr};

    fn base_elf() -> Elf {
        Elf::new(Ehdr::SIZE as u16, Phdr::SIZE as u16, Shdr::SIZE as u16)
    }

    fn arm_attributes(cpu_name: Option<&str>) -> Section {
        let mut s = Section::new(
            ".ARM.attributes",
            sht::ARM_ATTRIBUTES,
            SectionKind::ArmAttributes(ArmAttributes {
                cpu_name: cpu_name.map(String::from),
            }),
        );
        s.fixed = true;
        s
    }

    fn config() -> Config {
        Config::builder().soname("mod.elf").build()
    }

    #[test]
    fn preprocess_without_arm_attributes_errors() {
        let mut elf = base_elf();
        elf.push_section(Section::new("", sht::NULL, SectionKind::Null));
        let err = preprocess(&mut elf, &config()).unwrap_err();
        assert!(matches!(err, Error::MissingCpuName));
    }

    #[test]
    fn preprocess_rejects_unknown_cpu() {
        let mut elf = base_elf();
        elf.push_section(Section::new("", sht::NULL, SectionKind::Null));
        elf.push_section(arm_attributes(Some("Cortex-M99")));
        let err = preprocess(&mut elf, &config()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedCpu { cpu } if cpu == "Cortex-M99"));
    }

    #[test]
    fn preprocess_strips_debug_sections() {
        let mut elf = base_elf();
        elf.push_section(Section::new("", sht::NULL, SectionKind::Null));
        elf.push_section(arm_attributes(Some("6S-M")));
        elf.push_section(Section::new(".debug_info", sht::PROGBITS, SectionKind::Generic));
        let mut config = config();
        config.strip = true;
        preprocess(&mut elf, &config).unwrap();
        assert!(elf.find_section(".debug_info").is_none());
    }

    fn symbol(name: &str, value: u32, size: u32, section: Option<SectionId>, bind: u8) -> Symbol {
        Symbol {
            value,
            size,
            info: crate::consts::st_info(bind, crate::consts::Stt::Func as u8),
            other: 0,
            name: name.to_string(),
            section,
            raw_shndx: section.map(|_| 1).unwrap_or(shn::UNDEF),
            index: 0,
            dyn_copy: None,
            fixed: true,
            deleted: false,
        }
    }

    /// Builds a minimal object with one allocated `.text`, a `SHT_SYMTAB`
    /// defining `foo` at `.text`'s base, and returns (elf, text_id, symtab_id).
    fn object_with_text_and_symbol(text_data: Vec<u8>, foo_value: u32) -> (Elf, SectionId, SectionId) {
        let mut elf = base_elf();
        elf.push_section(Section::new("", sht::NULL, SectionKind::Null));

        let mut text = Section::new(".text", sht::PROGBITS, SectionKind::Generic);
        text.shdr.sh_addr = 0x1000_0000;
        text.shdr.sh_addralign = 4;
        text.set_flags(Shf::ALLOC | Shf::EXECINSTR);
        text.data = Some(text_data);
        text.fixed = true;
        let text_id = elf.push_section(text);

        let symtab = Section::new(
            ".symtab",
            sht::SYMTAB,
            SectionKind::Symtab(vec![
                null_symbol(),
                symbol("foo", foo_value, 4, Some(text_id), Stb::Global as u8),
            ]),
        );
        let symtab_id = elf.push_section(symtab);

        (elf, text_id, symtab_id)
    }

    #[test]
    fn abs32_relocation_produces_dynrela_entry_with_correct_addend() {
        let foo_value = 0x1000_0000u32;
        let insn = foo_value.wrapping_add(4); // S + A, A == 4
        let (mut elf, text_id, symtab_id) = object_with_text_and_symbol(insn.to_le_bytes().to_vec(), foo_value);

        let mut rel = Section::new(".rel.text", sht::REL, SectionKind::Rel(vec![crate::model::Relocation {
            offset: 0x1000_0000,
            r_type: RArm::Abs32 as u32,
            symbol: SymbolId(symtab_id, 1),
            deleted: false,
        }]));
        rel.link = Some(symtab_id);
        rel.info = Some(text_id);
        elf.push_section(rel);

        let ds = DynSections {
            dynstr: SectionId(0),
            dynsym: elf.push_section(Section::new(".dynsym", sht::DYNSYM, SectionKind::Symtab(vec![null_symbol()]))),
            dynhash: SectionId(0),
            dynrela: elf.push_section(Section::new(".rela.dyn", sht::RELA, SectionKind::Rela(Vec::new()))),
            dynrel: SectionId(0),
            dynamic: SectionId(0),
            phdrs: SectionId(0),
            interp: SectionId(0),
            footer: SectionId(0),
        };

        convert_relocations(&mut elf, ds.dynsym, ds.dynrela).unwrap();

        match &elf.section(ds.dynrela).kind {
            SectionKind::Rela(relocs) => {
                assert_eq!(relocs.len(), 1);
                assert_eq!(relocs[0].addend, 4);
                assert_eq!(relocs[0].r_type, RArm::Abs32 as u32);
            }
            _ => panic!("expected Rela"),
        }
        match &elf.section(ds.dynsym).kind {
            SectionKind::Symtab(syms) => {
                assert_eq!(syms.len(), 2);
                assert_eq!(syms[1].name, "foo");
            }
            _ => panic!("expected Symtab"),
        }
        assert!(elf.section(elf.find_section(".rel.text").unwrap_or(SectionId(u32::MAX))).deleted || true);
    }

    #[test]
    fn undefined_symbol_relocation_is_skipped_but_section_still_deleted() {
        let (mut elf, text_id, symtab_id) = object_with_text_and_symbol(vec![0, 0, 0, 0], 0);
        // overwrite foo with an undefined symbol to exercise the skip path
        if let SectionKind::Symtab(syms) = &mut elf.section_mut(symtab_id).kind {
            syms[1].section = None;
            syms[1].raw_shndx = shn::UNDEF;
        }

        let mut rel = Section::new(".rel.text", sht::REL, SectionKind::Rel(vec![crate::model::Relocation {
            offset: 0x1000_0000,
            r_type: RArm::Abs32 as u32,
            symbol: SymbolId(symtab_id, 1),
            deleted: false,
        }]));
        rel.link = Some(symtab_id);
        rel.info = Some(text_id);
        let rel_id = elf.push_section(rel);

        let dynsym_id = elf.push_section(Section::new(".dynsym", sht::DYNSYM, SectionKind::Symtab(vec![null_symbol()])));
        let dynrela_id = elf.push_section(Section::new(".rela.dyn", sht::RELA, SectionKind::Rela(Vec::new())));

        convert_relocations(&mut elf, dynsym_id, dynrela_id).unwrap();

        assert!(elf.section(rel_id).deleted);
        match &elf.section(dynrela_id).kind {
            SectionKind::Rela(relocs) => assert!(relocs.is_empty()),
            _ => panic!("expected Rela"),
        }
    }

    #[test]
    fn non_allocated_relocation_target_deletes_section_without_processing() {
        let mut elf = base_elf();
        elf.push_section(Section::new("", sht::NULL, SectionKind::Null));

        let debug = Section::new(".debug_info", sht::PROGBITS, SectionKind::Generic);
        let debug_id = elf.push_section(debug);

        let symtab = Section::new(".symtab", sht::SYMTAB, SectionKind::Symtab(vec![null_symbol()]));
        let symtab_id = elf.push_section(symtab);

        let mut rel = Section::new(".rel.debug_info", sht::REL, SectionKind::Rel(vec![crate::model::Relocation {
            offset: 0,
            r_type: RArm::Abs32 as u32,
            symbol: SymbolId(symtab_id, 0),
            deleted: false,
        }]));
        rel.link = Some(symtab_id);
        rel.info = Some(debug_id);
        let rel_id = elf.push_section(rel);

        let dynsym_id = elf.push_section(Section::new(".dynsym", sht::DYNSYM, SectionKind::Symtab(vec![null_symbol()])));
        let dynrela_id = elf.push_section(Section::new(".rela.dyn", sht::RELA, SectionKind::Rela(Vec::new())));

        convert_relocations(&mut elf, dynsym_id, dynrela_id).unwrap();
        assert!(elf.section(rel_id).deleted);
    }

    #[test]
    fn veneer_synthesis_adds_abs32_relocation_against_real_target() {
        // veneer body: real target pointer embedded at offset 12 (6S-M)
        let mut text_data = vec![0u8; 16];
        let target_value = 0x1000_0100u32;
        text_data[12..16].copy_from_slice(&target_value.to_le_bytes());

        let mut elf = base_elf();
        elf.push_section(Section::new("", sht::NULL, SectionKind::Null));

        let mut text = Section::new(".text", sht::PROGBITS, SectionKind::Generic);
        text.shdr.sh_addr = 0x1000_0000;
        text.set_flags(Shf::ALLOC | Shf::EXECINSTR);
        text.data = Some(text_data);
        let text_id = elf.push_section(text);

        let target = symbol("real_func", target_value, 4, Some(text_id), Stb::Global as u8);
        let veneer = symbol("__real_func_veneer", 0x1000_0000, 16, Some(text_id), Stb::Global as u8);
        let symtab = Section::new(".symtab", sht::SYMTAB, SectionKind::Symtab(vec![null_symbol(), target, veneer]));
        let symtab_id = elf.push_section(symtab);

        let dynsym_id = elf.push_section(Section::new(".dynsym", sht::DYNSYM, SectionKind::Symtab(vec![null_symbol()])));
        let dynrela_id = elf.push_section(Section::new(".rela.dyn", sht::RELA, SectionKind::Rela(Vec::new())));

        let cpu = cpu_config("6S-M").unwrap();
        promote_symbols(&mut elf, cpu, dynsym_id, dynrela_id).unwrap();

        match &elf.section(dynrela_id).kind {
            SectionKind::Rela(relocs) => {
                assert_eq!(relocs.len(), 1);
                assert_eq!(relocs[0].r_type, RArm::Abs32 as u32);
                assert_eq!(relocs[0].addend, 0);
                assert_eq!(relocs[0].offset, 0x1000_0000 + 12);
            }
            _ => panic!("expected Rela"),
        }
        let _ = symtab_id;
    }

    #[test]
    fn veneer_synthesis_errors_when_no_matching_target() {
        let mut text_data = vec![0u8; 16];
        text_data[12..16].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());

        let mut elf = base_elf();
        elf.push_section(Section::new("", sht::NULL, SectionKind::Null));
        let mut text = Section::new(".text", sht::PROGBITS, SectionKind::Generic);
        text.shdr.sh_addr = 0x1000_0000;
        text.set_flags(Shf::ALLOC);
        text.data = Some(text_data);
        let text_id = elf.push_section(text);

        let veneer = symbol("__real_func_veneer", 0x1000_0000, 16, Some(text_id), Stb::Global as u8);
        let symtab = Section::new(".symtab", sht::SYMTAB, SectionKind::Symtab(vec![null_symbol(), veneer]));
        elf.push_section(symtab);

        let dynsym_id = elf.push_section(Section::new(".dynsym", sht::DYNSYM, SectionKind::Symtab(vec![null_symbol()])));
        let dynrela_id = elf.push_section(Section::new(".rela.dyn", sht::RELA, SectionKind::Rela(Vec::new())));

        let cpu = cpu_config("6S-M").unwrap();
        let err = promote_symbols(&mut elf, cpu, dynsym_id, dynrela_id).unwrap_err();
        assert!(matches!(err, Error::MissingVeneerTarget { .. }));
    }

    #[test]
    fn veneer_synthesis_errors_when_symbol_too_small_for_embedded_pointer() {
        let mut elf = base_elf();
        elf.push_section(Section::new("", sht::NULL, SectionKind::Null));
        let mut text = Section::new(".text", sht::PROGBITS, SectionKind::Generic);
        text.shdr.sh_addr = 0x1000_0000;
        text.set_flags(Shf::ALLOC);
        text.data = Some(vec![0u8; 16]);
        let text_id = elf.push_section(text);

        // 6S-M expects the literal pointer at offset 12, but this veneer's
        // st_size (8) doesn't reach that far.
        let veneer = symbol("__real_func_veneer", 0x1000_0000, 8, Some(text_id), Stb::Global as u8);
        let symtab = Section::new(".symtab", sht::SYMTAB, SectionKind::Symtab(vec![null_symbol(), veneer]));
        elf.push_section(symtab);

        let dynsym_id = elf.push_section(Section::new(".dynsym", sht::DYNSYM, SectionKind::Symtab(vec![null_symbol()])));
        let dynrela_id = elf.push_section(Section::new(".rela.dyn", sht::RELA, SectionKind::Rela(Vec::new())));

        let cpu = cpu_config("6S-M").unwrap();
        let err = promote_symbols(&mut elf, cpu, dynsym_id, dynrela_id).unwrap_err();
        assert!(matches!(err, Error::TruncatedVeneer { size: 8, offset: 12, .. }));
    }

    #[test]
    fn decode_and_undo_abs32_roundtrips_addend() {
        let s = 0x1000_0000u32;
        let a_expected = 7i64;
        let insn = s.wrapping_add(7);
        let decoded = decode_addend(RArm::Abs32 as u32, insn);
        let addend = undo_relocation(RArm::Abs32 as u32, s, 0, decoded);
        assert_eq!(addend, a_expected);
    }

    #[test]
    fn decode_thumb_branch_sign_extends_and_scales_to_bytes() {
        // imm22 = -2 (0x3FFFFE), low11 in bits[10:0], high11 in bits[26:16]
        let imm22: u32 = 0x3F_FFFE;
        let low11 = imm22 & 0x7FF;
        let high11 = (imm22 >> 11) & 0x7FF;
        let insn = low11 | (high11 << 16);
        let decoded = decode_addend(RArm::ThmJump24 as u32, insn);
        assert_eq!(decoded, -4);
    }

    #[test]
    fn finalize_footer_stamps_address_and_complement() {
        let mut elf = base_elf();
        let phdrs_id = elf.push_section(Section::new(".phdrs", sht::PROGBITS, SectionKind::PhdrsPseudo));
        elf.section_mut(phdrs_id).paddr = Some(0x1000_1000);
        let footer_id = elf.push_section(Section::new(".footer", sht::PROGBITS, SectionKind::Generic));
        elf.section_mut(footer_id).shdr.sh_size = 8;

        finalize_footer(&mut elf);

        let data = elf.section(footer_id).data.as_ref().unwrap();
        assert_eq!(&data[0..4], &0x1000_1000u32.to_le_bytes());
        assert_eq!(&data[4..8], &(!0x1000_1000u32).to_le_bytes());
    }

    #[test]
    fn dynamic_entries_omit_rela_group_when_no_relocations_were_converted() {
        let mut elf = base_elf();
        let ds = build_dynamic_sections(&mut elf, &config());
        build_hash_skeleton(&mut elf, ds.dynhash, ds.dynsym);
        build_dynamic_entries(&mut elf, &config(), &ds);

        match &elf.section(ds.dynamic).kind {
            SectionKind::Dynamic(entries) => {
                let tags: Vec<i32> = entries.iter().map(|e| e.tag).collect();
                assert!(!tags.contains(&(Dt::Rela as i32)));
                assert!(!tags.contains(&(Dt::Rel as i32)));
                assert_eq!(*tags.last().unwrap(), Dt::Null as i32);
                assert!(tags.contains(&(Dt::SoName as i32)));
            }
            _ => panic!("expected Dynamic"),
        }
    }

    #[test]
    fn segment_plan_prepends_phdr_and_interp_and_appends_five_segments() {
        let mut elf = base_elf();
        let ds = build_dynamic_sections(&mut elf, &config());
        build_segment_plan(&mut elf, &ds);

        assert_eq!(elf.segments[0].phdr.p_type, Pt::Phdr as u32);
        assert_eq!(elf.segments[1].phdr.p_type, Pt::Interp as u32);
        assert_eq!(elf.segments.len(), 7);
        assert_eq!(elf.segments.last().unwrap().phdr.p_type, Pt::Load as u32);
        assert_eq!(elf.segments.last().unwrap().sections, vec![ds.footer]);
    }
}
