//! The nine transformation passes, run in order after the policy pass has
//! mutated the loaded graph. Each pass establishes the precondition the next
//! one relies on; see the module-level doc on [`run`].

use std::collections::HashMap;
use std::io::{Cursor, Seek, SeekFrom, Write};

use crate::consts::{align_up, sht, Pf, Shf, FLASH_BASE, PAGE_ALIGN, RAM_BASE};
use crate::error::{Error, Result};
use crate::model::{DynValue, Elf, SectionId, SectionKind, Symbol, SymbolId};
use crate::raw::{Dyn, Ehdr, Rel, Rela, Sym, ToWriter};

/// Run passes 1-7 (purge through segment layout); passes 8-9 are
/// [`write`], invoked once layout is final.
pub fn run(elf: &mut Elf) -> Result<()> {
    purge_deleted(elf);
    index_nodes(elf);
    register_strings(elf);
    build_strtabs(elf);
    compute_addresses(elf);
    compute_offsets(elf);
    compute_segments(elf)?;
    Ok(())
}

/// Pass 1: cascade-delete dangling cross-references to fixpoint, then
/// physically compact every owning list, remapping every stable index that
/// survives.
pub fn purge_deleted(elf: &mut Elf) {
    loop {
        let mut changed = false;

        for i in 0..elf.sections.len() {
            if elf.sections[i].deleted {
                continue;
            }
            let link_dead = elf.sections[i]
                .link
                .is_some_and(|l| elf.sections[l.0 as usize].deleted);
            let info_dead = elf.sections[i]
                .info
                .is_some_and(|m| elf.sections[m.0 as usize].deleted);
            if link_dead || info_dead {
                elf.sections[i].deleted = true;
                changed = true;
            }
        }

        for i in 0..elf.sections.len() {
            if elf.sections[i].deleted {
                continue;
            }
            if let SectionKind::Symtab(syms) = &mut elf.sections[i].kind {
                for sym in syms.iter_mut() {
                    if sym.deleted {
                        continue;
                    }
                    if let Some(s) = sym.section {
                        if elf.sections[s.0 as usize].deleted {
                            sym.deleted = true;
                            changed = true;
                        }
                    }
                }
            }
        }

        for i in 0..elf.sections.len() {
            if elf.sections[i].deleted {
                continue;
            }
            match &mut elf.sections[i].kind {
                SectionKind::Rel(rels) => {
                    for rel in rels.iter_mut() {
                        if !rel.deleted && symbol_is_deleted(&elf.sections, rel.symbol) {
                            rel.deleted = true;
                            changed = true;
                        }
                    }
                }
                SectionKind::Rela(relas) => {
                    for rela in relas.iter_mut() {
                        if !rela.deleted && symbol_is_deleted(&elf.sections, rela.symbol) {
                            rela.deleted = true;
                            changed = true;
                        }
                    }
                }
                _ => {}
            }
        }

        for segment in elf.segments.iter_mut() {
            if segment.deleted || segment.sections.is_empty() {
                continue;
            }
            let any_alive = segment
                .sections
                .iter()
                .any(|id| !elf.sections[id.0 as usize].deleted);
            if !any_alive {
                segment.deleted = true;
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }

    // Compact surviving symtabs' entry vectors, remembering the permutation.
    let mut symbol_remap: HashMap<(u32, u32), u32> = HashMap::new();
    for (si, section) in elf.sections.iter_mut().enumerate() {
        if section.deleted {
            continue;
        }
        if let SectionKind::Symtab(syms) = &mut section.kind {
            let old = std::mem::take(syms);
            let mut new_syms = Vec::with_capacity(old.len());
            for (old_idx, sym) in old.into_iter().enumerate() {
                if sym.deleted {
                    continue;
                }
                symbol_remap.insert((si as u32, old_idx as u32), new_syms.len() as u32);
                new_syms.push(sym);
            }
            *syms = new_syms;
        }
    }

    // Drop deleted relocations and remap the symbol refs that survive.
    for section in elf.sections.iter_mut() {
        if section.deleted {
            continue;
        }
        match &mut section.kind {
            SectionKind::Rel(rels) => {
                rels.retain_mut(|rel| {
                    if rel.deleted {
                        return false;
                    }
                    match symbol_remap.get(&(rel.symbol.0 .0, rel.symbol.1)) {
                        Some(&new_idx) => {
                            rel.symbol = SymbolId(rel.symbol.0, new_idx);
                            true
                        }
                        None => false,
                    }
                });
            }
            SectionKind::Rela(relas) => {
                relas.retain_mut(|rela| {
                    if rela.deleted {
                        return false;
                    }
                    match symbol_remap.get(&(rela.symbol.0 .0, rela.symbol.1)) {
                        Some(&new_idx) => {
                            rela.symbol = SymbolId(rela.symbol.0, new_idx);
                            true
                        }
                        None => false,
                    }
                });
            }
            _ => {}
        }
    }

    // Drop deleted sections and remap every SectionId reference crate-wide.
    let mut section_remap: HashMap<u32, u32> = HashMap::new();
    let mut kept_sections = Vec::with_capacity(elf.sections.len());
    for (old_idx, section) in elf.sections.drain(..).enumerate() {
        if section.deleted {
            continue;
        }
        section_remap.insert(old_idx as u32, kept_sections.len() as u32);
        kept_sections.push(section);
    }
    elf.sections = kept_sections;

    for section in elf.sections.iter_mut() {
        if let Some(l) = section.link {
            section.link = Some(SectionId(section_remap[&l.0]));
        }
        if let Some(m) = section.info {
            section.info = Some(SectionId(section_remap[&m.0]));
        }
        match &mut section.kind {
            SectionKind::Symtab(syms) => {
                for sym in syms.iter_mut() {
                    if let Some(s) = sym.section {
                        sym.section = Some(SectionId(section_remap[&s.0]));
                    }
                }
            }
            SectionKind::Rel(rels) => {
                for rel in rels.iter_mut() {
                    rel.symbol = SymbolId(SectionId(section_remap[&rel.symbol.0 .0]), rel.symbol.1);
                }
            }
            SectionKind::Rela(relas) => {
                for rela in relas.iter_mut() {
                    rela.symbol =
                        SymbolId(SectionId(section_remap[&rela.symbol.0 .0]), rela.symbol.1);
                }
            }
            _ => {}
        }
    }

    if let Some(sst) = elf.shstrtab {
        elf.shstrtab = section_remap.get(&sst.0).copied().map(SectionId);
    }

    let mut kept_segments = Vec::with_capacity(elf.segments.len());
    for segment in elf.segments.drain(..) {
        if segment.deleted {
            continue;
        }
        let mut segment = segment;
        segment.sections = segment
            .sections
            .iter()
            .filter_map(|id| section_remap.get(&id.0).copied().map(SectionId))
            .collect();
        kept_segments.push(segment);
    }
    elf.segments = kept_segments;
}

fn symbol_is_deleted(sections: &[crate::model::Section], id: SymbolId) -> bool {
    let section = &sections[id.0 .0 as usize];
    if section.deleted {
        return true;
    }
    match &section.kind {
        SectionKind::Symtab(syms) => syms.get(id.1 as usize).map_or(true, |s| s.deleted),
        _ => true,
    }
}

/// Pass 2: assign output section indices, and within each symtab, order
/// locals before globals (each stable-sorted by `st_value`) and renumber
/// symbols to match.
pub fn index_nodes(elf: &mut Elf) {
    let mut real_idx = 0u32;
    for section in elf.sections.iter_mut() {
        if matches!(
            section.kind,
            SectionKind::EhdrPseudo | SectionKind::PhdrsPseudo
        ) {
            // Not an on-disk section-table row; never the target of sh_link/
            // sh_info/st_shndx, so its numeric index is never consulted.
            section.index = u32::MAX;
            continue;
        }
        section.index = real_idx;
        real_idx += 1;
    }
    elf.ehdr.e_shnum = real_idx as u16;
    elf.ehdr.e_phnum = elf.segments.len() as u16;

    let mut symbol_remap: HashMap<(u32, u32), u32> = HashMap::new();

    for si in 0..elf.sections.len() {
        let is_symtab = matches!(elf.sections[si].kind, SectionKind::Symtab(_));
        if !is_symtab {
            continue;
        }

        let syms = match &mut elf.sections[si].kind {
            SectionKind::Symtab(syms) => std::mem::take(syms),
            _ => unreachable!(),
        };

        let (mut locals, mut globals): (Vec<(u32, Symbol)>, Vec<(u32, Symbol)>) = syms
            .into_iter()
            .enumerate()
            .map(|(idx, sym)| (idx as u32, sym))
            .partition(|(_, sym)| sym.bind() == crate::consts::Stb::Local as u8);
        locals.sort_by_key(|(_, sym)| sym.value);
        globals.sort_by_key(|(_, sym)| sym.value);

        let n_locals = locals.len() as u32;
        let mut new_syms = Vec::with_capacity(locals.len() + globals.len());
        for (new_idx, (old_idx, mut sym)) in locals.into_iter().chain(globals).enumerate() {
            sym.index = new_idx as u32;
            symbol_remap.insert((si as u32, old_idx), new_idx as u32);
            new_syms.push(sym);
        }

        elf.sections[si].shdr.sh_info = n_locals;
        elf.sections[si].kind = SectionKind::Symtab(new_syms);
    }

    for section in elf.sections.iter_mut() {
        match &mut section.kind {
            SectionKind::Rel(rels) => {
                rels.sort_by_key(|r| r.offset);
                for rel in rels.iter_mut() {
                    if let Some(&new_idx) = symbol_remap.get(&(rel.symbol.0 .0, rel.symbol.1)) {
                        rel.symbol = SymbolId(rel.symbol.0, new_idx);
                    }
                }
            }
            SectionKind::Rela(relas) => {
                relas.sort_by_key(|r| r.offset);
                for rela in relas.iter_mut() {
                    if let Some(&new_idx) = symbol_remap.get(&(rela.symbol.0 .0, rela.symbol.1)) {
                        rela.symbol = SymbolId(rela.symbol.0, new_idx);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Pass 3: enroll every name a later pass will need to look up into its
/// owning string table's registration list.
pub fn register_strings(elf: &mut Elf) {
    let shstrtab_id = elf.shstrtab.expect("loader always resolves shstrtab");
    let section_names: Vec<String> = elf.sections.iter().map(|s| s.name.clone()).collect();
    enroll(elf, shstrtab_id, &section_names);

    for si in 0..elf.sections.len() {
        let symtab_link = match &elf.sections[si].kind {
            SectionKind::Symtab(_) => elf.sections[si].link,
            _ => None,
        };
        let Some(link) = symtab_link else { continue };
        let names: Vec<String> = match &elf.sections[si].kind {
            SectionKind::Symtab(syms) => syms.iter().map(|s| s.name.clone()).collect(),
            _ => unreachable!(),
        };
        enroll(elf, link, &names);
    }

    for si in 0..elf.sections.len() {
        let dyn_link = match &elf.sections[si].kind {
            SectionKind::Dynamic(_) => elf.sections[si].link,
            _ => None,
        };
        let Some(link) = dyn_link else { continue };
        let names: Vec<String> = match &elf.sections[si].kind {
            SectionKind::Dynamic(dyns) => dyns
                .iter()
                .filter_map(|d| match &d.value {
                    DynValue::StringRef(s) => Some(s.clone()),
                    _ => None,
                })
                .collect(),
            _ => unreachable!(),
        };
        enroll(elf, link, &names);
    }
}

fn enroll(elf: &mut Elf, strtab_id: SectionId, names: &[String]) {
    if let SectionKind::Strtab { registered, .. } = &mut elf.section_mut(strtab_id).kind {
        for name in names {
            if !name.is_empty() && !registered.contains(name) {
                registered.push(name.clone());
            }
        }
    }
}

/// Pass 4: build the suffix-packed byte buffer for every strtab not already
/// carrying raw `data` (i.e. every synthesized one; loaded strtabs already
/// have their on-disk bytes).
pub fn build_strtabs(elf: &mut Elf) {
    for section in elf.sections.iter_mut() {
        if section.data.is_some() {
            continue;
        }
        if let SectionKind::Strtab { registered, offsets } = &mut section.kind {
            let (data, built) = crate::strtab::build(registered);
            *offsets = built;
            section.data = Some(data);
        }
    }
}

/// Pass 5: propagate `paddr` from fixed segments, then walk the two
/// flash/RAM cursors across every section in stored order.
pub fn compute_addresses(elf: &mut Elf) {
    for segi in 0..elf.segments.len() {
        let (p_vaddr, p_paddr, sections) = {
            let seg = &elf.segments[segi];
            (seg.phdr.p_vaddr, seg.phdr.p_paddr, seg.sections.clone())
        };
        let delta = p_paddr.wrapping_sub(p_vaddr);
        for sid in sections {
            let section = elf.section_mut(sid);
            section.paddr = Some(section.shdr.sh_addr.wrapping_add(delta));
        }
    }

    let phdrs_size = elf.ehdr.e_phnum as u32 * elf.ehdr.e_phentsize as u32;
    let ehdr_size = elf.ehdr.e_ehsize as u32;
    for section in elf.sections.iter_mut() {
        match section.kind {
            SectionKind::PhdrsPseudo => section.shdr.sh_size = phdrs_size,
            SectionKind::EhdrPseudo => section.shdr.sh_size = ehdr_size,
            _ => {}
        }
    }

    let mut next_flash = FLASH_BASE;
    let mut next_ram = RAM_BASE;

    for section in elf.sections.iter_mut() {
        section.shdr.sh_size = section.size();
        let flags = section.flags();
        if !flags.contains(Shf::ALLOC) {
            continue;
        }

        if flags.contains(Shf::WRITE) {
            if !section.fixed {
                section.shdr.sh_addr = align_up(next_ram, section.shdr.sh_addralign);
            }
            next_ram = section.shdr.sh_addr + align_up(section.size(), section.shdr.sh_addralign);
        }

        if !flags.contains(Shf::WRITE) || section.shdr.sh_type != sht::NOBITS {
            if !section.fixed {
                section.paddr = Some(align_up(next_flash, section.shdr.sh_addralign));
            }
            let paddr = section.paddr.unwrap_or(section.shdr.sh_addr);
            next_flash = paddr + align_up(section.psize(), section.shdr.sh_addralign);
        }

        if !section.fixed {
            if !flags.contains(Shf::WRITE) {
                section.shdr.sh_addr = section.paddr.unwrap_or(section.shdr.sh_addr);
            } else if section.shdr.sh_type == sht::NOBITS {
                section.paddr = Some(section.shdr.sh_addr);
            }
        }
    }
}

/// Pass 6: assign file offsets, separating the program-header block from
/// section payloads by a page-aligned gap.
pub fn compute_offsets(elf: &mut Elf) {
    let mut offset = elf.ehdr.e_ehsize as u32;

    offset = align_up(offset, 4);
    elf.ehdr.e_phoff = offset;
    offset += elf.ehdr.e_phnum as u32 * elf.ehdr.e_phentsize as u32;

    offset = align_up(offset, PAGE_ALIGN);

    for section in elf.sections.iter_mut() {
        if section.shdr.sh_type == sht::NULL {
            continue;
        }
        match section.kind {
            SectionKind::PhdrsPseudo => {
                section.shdr.sh_offset = elf.ehdr.e_phoff;
                continue;
            }
            SectionKind::EhdrPseudo => {
                section.shdr.sh_offset = 0;
                continue;
            }
            _ => {}
        }
        offset = align_up(offset, section.shdr.sh_addralign.max(1));
        section.shdr.sh_offset = offset;
        offset += section.psize();
    }

    offset = align_up(offset, 4);
    elf.ehdr.e_shoff = offset;
}

/// Pass 7: derive non-fixed segments' layout fields from their member
/// sections; fixed segments are asserted to have only fixed members.
pub fn compute_segments(elf: &mut Elf) -> Result<()> {
    for segi in 0..elf.segments.len() {
        let fixed = elf.segments[segi].fixed;
        let member_ids = elf.segments[segi].sections.clone();

        if fixed {
            for sid in &member_ids {
                if !elf.section(*sid).fixed {
                    return Err(Error::SegmentLayoutViolation {
                        reason: format!(
                            "fixed segment has non-fixed member section {:?}",
                            elf.section(*sid).name
                        ),
                    });
                }
            }
            continue;
        }

        let Some(&first_id) = member_ids.first() else {
            continue;
        };

        let first = elf.section(first_id);
        let p_offset = first.shdr.sh_offset;
        let p_vaddr = first.shdr.sh_addr;
        let p_paddr = first.paddr.unwrap_or(first.shdr.sh_addr);
        let mut p_filesz = 0u32;
        let mut p_memsz = 0u32;
        let mut p_flags = Pf::R.bits();
        let mut p_align = 1u32;

        for sid in &member_ids {
            let section = elf.section(*sid);
            if section.shdr.sh_offset < p_offset + p_filesz {
                return Err(Error::SegmentLayoutViolation {
                    reason: format!(
                        "section {:?} file offset precedes segment cursor",
                        section.name
                    ),
                });
            }
            let section_paddr = section.paddr.unwrap_or(section.shdr.sh_addr);
            if section_paddr < p_paddr + p_memsz {
                return Err(Error::SegmentLayoutViolation {
                    reason: format!(
                        "section {:?} physical address precedes segment cursor",
                        section.name
                    ),
                });
            }
            if section.shdr.sh_addr < p_vaddr + p_memsz {
                return Err(Error::SegmentLayoutViolation {
                    reason: format!(
                        "section {:?} virtual address precedes segment cursor",
                        section.name
                    ),
                });
            }

            p_filesz = section.shdr.sh_offset + section.psize() - p_offset;
            p_memsz = section.shdr.sh_addr + section.size() - p_vaddr;

            let flags = section.flags();
            if flags.contains(Shf::WRITE) {
                p_flags |= Pf::W.bits();
            }
            if flags.contains(Shf::EXECINSTR) {
                p_flags |= Pf::X.bits();
            }
            p_align = p_align.max(section.shdr.sh_addralign.max(1));
        }

        let seg = &mut elf.segments[segi];
        seg.phdr.p_offset = p_offset;
        seg.phdr.p_vaddr = p_vaddr;
        seg.phdr.p_paddr = p_paddr;
        seg.phdr.p_filesz = p_filesz;
        seg.phdr.p_memsz = p_memsz;
        seg.phdr.p_flags = p_flags;
        seg.phdr.p_align = p_align;
    }

    Ok(())
}

/// Passes 8-9: serialize the final graph to a byte buffer, sized to the
/// layout the prior passes computed.
pub fn write(elf: &mut Elf) -> Result<Vec<u8>> {
    if let Some(shstrtab) = elf.shstrtab {
        elf.ehdr.e_shstrndx = elf.section(shstrtab).index as u16;
    }

    let mut size = elf.ehdr.e_shoff as usize
        + elf.ehdr.e_shnum as usize * elf.ehdr.e_shentsize as usize;
    for section in &elf.sections {
        size = size.max(section.shdr.sh_offset as usize + section.psize() as usize);
    }

    let mut buf = vec![0u8; size];
    {
        let mut cursor = Cursor::new(&mut buf);
        write_data(elf, &mut cursor)?;
        write_headers(elf, &mut cursor)?;
    }
    Ok(buf)
}

fn strtab_offset(elf: &Elf, strtab_id: Option<SectionId>, name: &str) -> u32 {
    if name.is_empty() {
        return 0;
    }
    match strtab_id.map(|id| &elf.section(id).kind) {
        Some(SectionKind::Strtab { offsets, .. }) => *offsets.get(name).unwrap_or(&0),
        _ => 0,
    }
}

fn resolve_dyn_value(elf: &Elf, strtab_id: Option<SectionId>, value: &DynValue) -> u32 {
    match value {
        DynValue::Const(v) => *v,
        DynValue::StringRef(s) => strtab_offset(elf, strtab_id, s),
        DynValue::AddressOf(sid) => elf.section(*sid).shdr.sh_addr,
        DynValue::SizeOf(sid) => elf.section(*sid).size(),
    }
}

fn write_data<W: Write + Seek>(elf: &Elf, writer: &mut W) -> Result<()> {
    for section in &elf.sections {
        if section.shdr.sh_type == sht::NULL || section.shdr.sh_type == sht::NOBITS {
            continue;
        }
        writer.seek(SeekFrom::Start(section.shdr.sh_offset as u64))?;

        match &section.kind {
            SectionKind::Symtab(syms) => {
                for sym in syms {
                    let raw = Sym {
                        st_name: strtab_offset(elf, section.link, &sym.name),
                        st_value: sym.value,
                        st_size: sym.size,
                        st_info: sym.info,
                        st_other: sym.other,
                        st_shndx: sym
                            .section
                            .map(|s| elf.section(s).index as u16)
                            .unwrap_or(sym.raw_shndx),
                    };
                    raw.to_writer(writer)?;
                }
            }
            SectionKind::Rel(rels) => {
                for rel in rels {
                    let sym_index = elf.symbol(rel.symbol).index;
                    let raw = Rel {
                        r_offset: rel.offset,
                        r_info: crate::consts::r_info(sym_index, rel.r_type),
                    };
                    raw.to_writer(writer)?;
                }
            }
            SectionKind::Rela(relas) => {
                for rela in relas {
                    let sym_index = elf.symbol(rela.symbol).index;
                    let raw = Rela {
                        r_offset: rela.offset,
                        r_info: crate::consts::r_info(sym_index, rela.r_type),
                        r_addend: rela.addend,
                    };
                    raw.to_writer(writer)?;
                }
            }
            SectionKind::Dynamic(dyns) => {
                for entry in dyns {
                    let raw = Dyn {
                        d_tag: entry.tag,
                        d_un: resolve_dyn_value(elf, section.link, &entry.value),
                    };
                    raw.to_writer(writer)?;
                }
            }
            _ => {
                if let Some(data) = &section.data {
                    writer.write_all(data)?;
                }
            }
        }
    }
    Ok(())
}

fn write_headers<W: Write + Seek>(elf: &Elf, writer: &mut W) -> Result<()> {
    writer.seek(SeekFrom::Start(0))?;
    elf.ehdr.to_writer(writer)?;

    writer.seek(SeekFrom::Start(elf.ehdr.e_phoff as u64))?;
    for segment in &elf.segments {
        segment.phdr.to_writer(writer)?;
    }

    writer.seek(SeekFrom::Start(elf.ehdr.e_shoff as u64))?;
    for section in elf
        .sections
        .iter()
        .filter(|s| !matches!(s.kind, SectionKind::EhdrPseudo | SectionKind::PhdrsPseudo))
    {
        let mut shdr = section.shdr;
        shdr.sh_name = strtab_offset(elf, elf.shstrtab, &section.name);
        shdr.sh_link = section.link.map(|l| elf.section(l).index).unwrap_or(0);
        if let Some(info) = section.info {
            shdr.sh_flags |= Shf::INFO_LINK.bits();
            shdr.sh_info = elf.section(info).index;
        }
        shdr.to_writer(writer)?;
    }
    Ok(())
}
