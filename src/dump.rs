//! Human-readable rendering of the object graph, for `--dump`. Grounded on
//! the source's trivial `Dump(Visitor)` class: one line per section, one
//! line per segment, walked through [`crate::visitor::Visitor`]'s default
//! traversal.

use std::io::Write;

use crate::model::{Elf, Section, SectionId, SectionKind, Segment, SegmentId};
use crate::visitor::Visitor;

/// Writes one line per section (plus one per entry, for entry-bearing
/// sections) and one line per segment.
pub struct Dump<'w, W: Write> {
    out: &'w mut W,
}

impl<'w, W: Write> Dump<'w, W> {
    /// Build a dumper writing to `out`
    pub fn new(out: &'w mut W) -> Self {
        Self { out }
    }
}

impl<W: Write> Visitor for Dump<'_, W> {
    fn visit_plain_section(&mut self, _elf: &Elf, id: SectionId, section: &Section) {
        let _ = writeln!(
            self.out,
            "[{:>3}] {:<20} type={:#x} flags={:#x} addr={:#010x} size={:#x}",
            id.0,
            section.name,
            section.shdr.sh_type,
            section.shdr.sh_flags,
            section.shdr.sh_addr,
            section.size(),
        );
    }

    fn visit_entry_section(&mut self, elf: &Elf, id: SectionId, section: &Section) {
        self.visit_plain_section(elf, id, section);
        match &section.kind {
            SectionKind::Symtab(syms) => {
                for (i, sym) in syms.iter().enumerate() {
                    let _ = writeln!(
                        self.out,
                        "      {i:>3}: value={:#010x} size={:<6} {}",
                        sym.value, sym.size, sym.name,
                    );
                }
            }
            SectionKind::Rel(rels) => {
                for rel in rels {
                    let _ = writeln!(self.out, "      offset={:#010x} type={}", rel.offset, rel.r_type);
                }
            }
            SectionKind::Rela(relas) => {
                for rela in relas {
                    let _ = writeln!(
                        self.out,
                        "      offset={:#010x} type={} addend={}",
                        rela.offset, rela.r_type, rela.addend,
                    );
                }
            }
            SectionKind::Dynamic(entries) => {
                for entry in entries {
                    let _ = writeln!(self.out, "      tag={} value={:?}", entry.tag, entry.value);
                }
            }
            _ => {}
        }
    }

    fn visit_segment(&mut self, _elf: &Elf, id: SegmentId, segment: &Segment) {
        let _ = writeln!(
            self.out,
            "segment {:>2} type={:#x} flags={:#x} vaddr={:#010x} paddr={:#010x} filesz={:#x} memsz={:#x}",
            id.0,
            segment.phdr.p_type,
            segment.phdr.p_flags,
            segment.phdr.p_vaddr,
            segment.phdr.p_paddr,
            segment.phdr.p_filesz,
            segment.phdr.p_memsz,
        );
    }
}

/// Render `elf`'s sections and segments to a string
pub fn dump_to_string(elf: &Elf) -> String {
    let mut buf = Vec::new();
    Dump::new(&mut buf).visit_elf(elf);
    String::from_utf8_lossy(&buf).into_owned()
}
