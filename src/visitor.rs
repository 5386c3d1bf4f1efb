//! Visitor dispatch over the object graph.
//!
//! The source dispatches on a Python class hierarchy, walking `__bases__`
//! until it finds a defined `visit_{ClassName}` method. Here the hierarchy
//! is a tagged union (`SectionKind`) and the walk-up-the-chain fallback is
//! expressed as default trait methods that forward to a more general method,
//! exactly mirroring which handler would have matched first in the source.
//! Most pipeline passes are simple, total matches over `SectionKind` instead
//! of visitor implementations — the trait earns its keep where the fallback
//! chain itself is the point, namely object-graph introspection (`Dump`).

use crate::model::{Elf, Section, SectionId, SectionKind, Segment, SegmentId};

/// A read-only walk over the object graph with hierarchy-walking fallback
/// dispatch, mirroring the source's `Visitor` base class.
pub trait Visitor {
    /// Entry point: by default visits every non-deleted section, then every
    /// non-deleted segment, in stored order.
    fn visit_elf(&mut self, elf: &Elf) {
        for (i, section) in elf.sections.iter().enumerate() {
            if !section.deleted {
                self.visit_section(elf, SectionId(i as u32), section);
            }
        }
        for (i, segment) in elf.segments.iter().enumerate() {
            if !segment.deleted {
                self.visit_segment(elf, SegmentId(i as u32), segment);
            }
        }
    }

    /// Dispatches by `SectionKind`; the default for every variant forwards
    /// to [`Visitor::visit_entry_section`] or [`Visitor::visit_plain_section`]
    /// depending on whether the variant carries an entry vector, mirroring
    /// `SymtabSection -> EntrySection -> Section -> Node`.
    fn visit_section(&mut self, elf: &Elf, id: SectionId, section: &Section) {
        match &section.kind {
            SectionKind::Symtab(_)
            | SectionKind::Rel(_)
            | SectionKind::Rela(_)
            | SectionKind::Dynamic(_) => self.visit_entry_section(elf, id, section),
            _ => self.visit_plain_section(elf, id, section),
        }
    }

    /// Fallback for sections whose contents are a homogeneous entry array.
    /// Default behavior: visit header concerns, i.e. defer to the plain
    /// section handler (entries are walked by the concrete override, if any).
    fn visit_entry_section(&mut self, elf: &Elf, id: SectionId, section: &Section) {
        self.visit_plain_section(elf, id, section);
    }

    /// Base case: a section with no further-specialized handler. No-op by default.
    #[allow(unused_variables)]
    fn visit_plain_section(&mut self, elf: &Elf, id: SectionId, section: &Section) {}

    /// No-op by default.
    #[allow(unused_variables)]
    fn visit_segment(&mut self, elf: &Elf, id: SegmentId, segment: &Segment) {}
}
