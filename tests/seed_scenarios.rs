//! End-to-end seed scenarios exercising the full rewrite
//! (`loader`-shaped object graph -> `policy::apply` -> `pipeline::run` ->
//! `policy::finalize_footer` -> `pipeline::write`), built directly against
//! in-memory `Elf` graphs since no external fixture binaries are available
//! in this environment.

use mkextmod::config::Config;
use mkextmod::consts::{sht, shn, Shf, Stb, Stt, RArm};
use mkextmod::model::{
    ArmAttributes, Elf, Relocation, Section, SectionId, SectionKind, Symbol, SymbolId,
};
use mkextmod::raw::{Ehdr, Phdr, Shdr};
use mkextmod::{pipeline, policy};

fn new_elf() -> Elf {
    Elf::new(Ehdr::SIZE as u16, Phdr::SIZE as u16, Shdr::SIZE as u16)
}

fn arm_attributes(cpu_name: &str) -> Section {
    let mut s = Section::new(
        ".ARM.attributes",
        sht::ARM_ATTRIBUTES,
        SectionKind::ArmAttributes(ArmAttributes {
            cpu_name: Some(cpu_name.to_string()),
        }),
    );
    s.fixed = true;
    s
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
        fixed: true,
        deleted: false,
    }
}

fn global_func(name: &str, value: u32, size: u32, section: Option<SectionId>) -> Symbol {
    Symbol {
        value,
        size,
        info: mkextmod::consts::st_info(Stb::Global as u8, Stt::Func as u8),
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

fn run_transform(elf: &mut Elf, config: &Config) -> Vec<u8> {
    policy::apply(elf, config).expect("policy pass");
    pipeline::run(elf).expect("layout passes");
    policy::finalize_footer(elf);
    pipeline::write(elf).expect("serialize")
}

/// Seed case 1: a single 4-byte `.text` of two NOPs, no relocations,
/// `__dl_init` at offset 0, CPU `8-M.MAIN`. The output carries `DT_INIT = 0`
/// and an 8-byte `.hash` of `(0, nchain)` where `nchain` counts the null
/// symbol plus the promoted init symbol.
#[test]
fn empty_input_sections_wire_dt_init_and_hash_skeleton() {
    let mut elf = new_elf();
    elf.push_section(Section::new("", sht::NULL, SectionKind::Null));
    elf.push_section(arm_attributes("8-M.MAIN"));

    let mut text = Section::new(".text", sht::PROGBITS, SectionKind::Generic);
    text.shdr.sh_addr = 0x1000_0000;
    text.shdr.sh_addralign = 4;
    text.set_flags(Shf::ALLOC | Shf::EXECINSTR);
    text.data = Some(vec![0x00, 0xBF, 0x00, 0xBF]);
    text.fixed = true;
    let text_id = elf.push_section(text);

    let symtab = Section::new(
        ".symtab",
        sht::SYMTAB,
        SectionKind::Symtab(vec![
            null_symbol(),
            global_func("__dl_init", 0x1000_0000, 0, Some(text_id)),
        ]),
    );
    elf.push_section(symtab);

    let config = Config::builder().soname("mod.elf").build();
    let out = run_transform(&mut elf, &config);

    let reloaded = mkextmod::loader::load(&out).expect("reload rewritten object");
    let dynamic_id = reloaded.find_section(".dynamic").expect(".dynamic present");
    let init = match &reloaded.section(dynamic_id).kind {
        SectionKind::Dynamic(entries) => entries
            .iter()
            .find(|e| e.tag == mkextmod::consts::Dt::Init as i32)
            .expect("DT_INIT present"),
        _ => panic!("expected Dynamic"),
    };
    match &init.value {
        mkextmod::model::DynValue::Const(v) => assert_eq!(*v, 0x1000_0000),
        other => panic!("unexpected DT_INIT value: {other:?}"),
    }

    let hash_id = reloaded.find_section(".hash").expect(".hash present");
    let hash_data = reloaded.section(hash_id).data.as_ref().expect(".hash has data");
    assert_eq!(hash_data.len(), 8);
    assert_eq!(&hash_data[0..4], &0u32.to_le_bytes());
    assert_eq!(&hash_data[4..8], &2u32.to_le_bytes());
}

/// Seed case 2: an `R_ARM_ABS32` relocation against a global symbol produces
/// exactly one `.rela.dyn` entry with the addend needed to reconstruct the
/// original referent.
#[test]
fn abs32_relocation_yields_one_rela_entry_with_reconstructed_addend() {
    let mut elf = new_elf();
    elf.push_section(Section::new("", sht::NULL, SectionKind::Null));
    elf.push_section(arm_attributes("8-M.MAIN"));

    let target_value = 0x1000_1000u32;
    let stored_word = 0xEFBE_ADDEu32; // raw bytes DE AD BE EF, little-endian

    let mut text = Section::new(".text", sht::PROGBITS, SectionKind::Generic);
    text.shdr.sh_addr = 0x1000_0000;
    text.shdr.sh_addralign = 4;
    text.set_flags(Shf::ALLOC);
    text.data = Some(stored_word.to_le_bytes().to_vec());
    text.fixed = true;
    let text_id = elf.push_section(text);

    let symtab = Section::new(
        ".symtab",
        sht::SYMTAB,
        SectionKind::Symtab(vec![
            null_symbol(),
            global_func("target", target_value, 4, Some(text_id)),
        ]),
    );
    let symtab_id = elf.push_section(symtab);

    let mut rel = Section::new(
        ".rel.text",
        sht::REL,
        SectionKind::Rel(vec![Relocation {
            offset: 0x1000_0000,
            r_type: RArm::Abs32 as u32,
            symbol: SymbolId(symtab_id, 1),
            deleted: false,
        }]),
    );
    rel.link = Some(symtab_id);
    rel.info = Some(text_id);
    elf.push_section(rel);

    let config = Config::builder().soname("mod.elf").build();
    let out = run_transform(&mut elf, &config);

    let reloaded = mkextmod::loader::load(&out).expect("reload rewritten object");
    let rela_id = reloaded.find_section(".rela.dyn").expect(".rela.dyn present");
    match &reloaded.section(rela_id).kind {
        SectionKind::Rela(entries) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].offset, 0x1000_0000);
            assert_eq!(entries[0].r_type, RArm::Abs32 as u32);
            assert_eq!(
                entries[0].addend,
                (stored_word as i64 - target_value as i64) as i32
            );
        }
        other => panic!("expected Rela, got {other:?}"),
    }
    assert!(reloaded.find_section(".rel.text").is_none());
}

/// Seed case 3: a `THM_JUMP24` branch whose source and target are both in
/// the same 256 MiB bank needs no `Rela`; the original `.rel.*` section is
/// still deleted.
#[test]
fn in_bank_thumb_branch_emits_no_rela_but_deletes_rel_section() {
    let mut elf = new_elf();
    elf.push_section(Section::new("", sht::NULL, SectionKind::Null));
    elf.push_section(arm_attributes("8-M.MAIN"));

    let mut text = Section::new(".text", sht::PROGBITS, SectionKind::Generic);
    text.shdr.sh_addr = 0x1000_0000;
    text.shdr.sh_addralign = 4;
    text.set_flags(Shf::ALLOC | Shf::EXECINSTR);
    // encodes a zero-displacement THM_JUMP24 (imm22 == 0)
    text.data = Some(vec![0x00, 0x00, 0x00, 0x00]);
    text.fixed = true;
    let text_id = elf.push_section(text);

    let symtab = Section::new(
        ".symtab",
        sht::SYMTAB,
        SectionKind::Symtab(vec![
            null_symbol(),
            global_func("callee", 0x1000_0004, 4, Some(text_id)),
        ]),
    );
    let symtab_id = elf.push_section(symtab);

    let mut rel = Section::new(
        ".rel.text",
        sht::REL,
        SectionKind::Rel(vec![Relocation {
            offset: 0x1000_0000,
            r_type: RArm::ThmJump24 as u32,
            symbol: SymbolId(symtab_id, 1),
            deleted: false,
        }]),
    );
    rel.link = Some(symtab_id);
    rel.info = Some(text_id);
    elf.push_section(rel);

    let config = Config::builder().soname("mod.elf").build();
    let out = run_transform(&mut elf, &config);

    let reloaded = mkextmod::loader::load(&out).expect("reload rewritten object");
    assert!(reloaded.find_section(".rel.text").is_none());
    let rela_id = reloaded.find_section(".rela.dyn").expect(".rela.dyn present");
    match &reloaded.section(rela_id).kind {
        SectionKind::Rela(entries) => assert!(entries.is_empty()),
        other => panic!("expected Rela, got {other:?}"),
    }
}

/// Seed case 4: a cross-bank Thumb call routed through a veneer synthesizes
/// an `R_ARM_ABS32` at the veneer's literal-pool offset, addend zero,
/// against the real target's dynamic symbol copy.
#[test]
fn cross_bank_veneer_synthesizes_abs32_relocation() {
    let mut elf = new_elf();
    elf.push_section(Section::new("", sht::NULL, SectionKind::Null));
    elf.push_section(arm_attributes("6S-M"));

    let mut veneer_data = vec![0u8; 16];
    let real_target = 0x2000_0001u32;
    veneer_data[12..16].copy_from_slice(&real_target.to_le_bytes());

    let mut text = Section::new(".text", sht::PROGBITS, SectionKind::Generic);
    text.shdr.sh_addr = 0x1000_0100;
    text.shdr.sh_addralign = 4;
    text.set_flags(Shf::ALLOC | Shf::EXECINSTR);
    text.data = Some(veneer_data);
    text.fixed = true;
    let text_id = elf.push_section(text);

    let symtab = Section::new(
        ".symtab",
        sht::SYMTAB,
        SectionKind::Symtab(vec![
            null_symbol(),
            global_func("foo", real_target, 4, None),
            global_func("__foo_veneer", 0x1000_0100, 16, Some(text_id)),
        ]),
    );
    elf.push_section(symtab);

    let config = Config::builder().soname("mod.elf").build();
    let out = run_transform(&mut elf, &config);

    let reloaded = mkextmod::loader::load(&out).expect("reload rewritten object");
    let rela_id = reloaded.find_section(".rela.dyn").expect(".rela.dyn present");
    match &reloaded.section(rela_id).kind {
        SectionKind::Rela(entries) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].offset, 0x1000_0100 + 12);
            assert_eq!(entries[0].r_type, RArm::Abs32 as u32);
            assert_eq!(entries[0].addend, 0);
        }
        other => panic!("expected Rela, got {other:?}"),
    }
}

/// Seed case 5: `--strip` deletes `.debug*` sections and their relocations;
/// no `.debug*` section survives and no dangling cross-reference remains.
#[test]
fn strip_removes_debug_sections_and_their_relocations() {
    let mut elf = new_elf();
    elf.push_section(Section::new("", sht::NULL, SectionKind::Null));
    elf.push_section(arm_attributes("8-M.MAIN"));

    let debug_info = Section::new(".debug_info", sht::PROGBITS, SectionKind::Generic);
    let debug_info_id = elf.push_section(debug_info);
    let debug_line = Section::new(".debug_line", sht::PROGBITS, SectionKind::Generic);
    elf.push_section(debug_line);

    let symtab = Section::new(".symtab", sht::SYMTAB, SectionKind::Symtab(vec![null_symbol()]));
    let symtab_id = elf.push_section(symtab);

    let mut rel_debug = Section::new(
        ".rel.debug_info",
        sht::REL,
        SectionKind::Rel(vec![Relocation {
            offset: 0,
            r_type: RArm::Abs32 as u32,
            symbol: SymbolId(symtab_id, 0),
            deleted: false,
        }]),
    );
    rel_debug.link = Some(symtab_id);
    rel_debug.info = Some(debug_info_id);
    elf.push_section(rel_debug);

    let mut config = Config::builder().soname("mod.elf").build();
    config.strip = true;
    let out = run_transform(&mut elf, &config);

    let reloaded = mkextmod::loader::load(&out).expect("reload rewritten object");
    assert!(reloaded.find_section(".debug_info").is_none());
    assert!(reloaded.find_section(".debug_line").is_none());
    assert!(reloaded.find_section(".rel.debug_info").is_none());
    for section in &reloaded.sections {
        if let Some(link) = section.link {
            assert!((link.0 as usize) < reloaded.sections.len());
        }
        if let Some(info) = section.info {
            assert!((info.0 as usize) < reloaded.sections.len());
        }
    }
}

/// Seed case 6: the footer's 8 bytes encode `.phdrs`' resolved physical
/// address followed by its bitwise complement.
#[test]
fn footer_encodes_phdrs_address_and_complement() {
    let mut elf = new_elf();
    elf.push_section(Section::new("", sht::NULL, SectionKind::Null));
    elf.push_section(arm_attributes("8-M.MAIN"));

    let mut text = Section::new(".text", sht::PROGBITS, SectionKind::Generic);
    text.shdr.sh_addr = 0x1000_0000;
    text.shdr.sh_addralign = 4;
    text.set_flags(Shf::ALLOC | Shf::EXECINSTR);
    text.data = Some(vec![0x00, 0xBF, 0x00, 0xBF]);
    text.fixed = true;
    elf.push_section(text);

    let config = Config::builder().soname("mod.elf").build();
    let out = run_transform(&mut elf, &config);

    let reloaded = mkextmod::loader::load(&out).expect("reload rewritten object");
    let footer_id = reloaded.find_section(".footer").expect(".footer present");
    let footer_data = reloaded.section(footer_id).data.as_ref().expect(".footer has data");
    assert_eq!(footer_data.len(), 8);
    let phdr_addr = u32::from_le_bytes(footer_data[0..4].try_into().unwrap());
    let complement = u32::from_le_bytes(footer_data[4..8].try_into().unwrap());
    assert_eq!(complement, !phdr_addr);
}
