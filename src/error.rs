//! Error type for the rewriter

#[derive(thiserror::Error, Debug)]
/// Errors raised while loading, transforming, or writing an ELF object
pub enum Error {
    #[error("An I/O error occurred: {0}")]
    /// Wraps a lower-level I/O failure
    Io(#[from] std::io::Error),

    #[error("malformed input: ELF header field {field} has invalid value {value}")]
    /// A fixed ELF header field does not hold its mandated value
    InvalidHeaderField {
        /// The name of the offending field (e.g. `e_ehsize`)
        field: &'static str,
        /// The value actually found
        value: u32,
    },

    #[error("malformed input: section index {index} is out of range (have {count} sections)")]
    /// A `sh_link`/`sh_info`/`st_shndx`/`r_sym` index referred to a section that does not exist
    SectionIndexOutOfRange {
        /// The offending index
        index: u32,
        /// The number of sections actually present
        count: usize,
    },

    #[error("malformed input: string table offset {offset} in section {section} is not NUL-terminated")]
    /// A string-table lookup walked off the end of the table without finding a NUL
    UnterminatedString {
        /// The section holding the string table
        section: String,
        /// The offset that was looked up
        offset: u32,
    },

    #[error("no ARM attributes CPU name found in input")]
    /// The `.ARM.attributes` section was missing or did not carry a `Tag_CPU_name`
    MissingCpuName,

    #[error("unsupported CPU {cpu:?}")]
    /// The CPU name found does not appear in the supported per-CPU configuration table
    UnsupportedCpu {
        /// The CPU name as read from the attributes section
        cpu: String,
    },

    #[error("unsupported relocation type {r_type} against symbol {symbol:?} in section {section:?}")]
    /// A relocation's type fell outside the set this rewriter knows how to reverse-engineer
    UnsupportedRelocationType {
        /// The raw ARM relocation type
        r_type: u32,
        /// The name of the symbol the relocation targets
        symbol: String,
        /// The name of the section holding the relocation
        section: String,
    },

    #[error("missing veneer target symbol {name:?} referenced by veneer")]
    /// A `__<X>_veneer` symbol's embedded target could not be matched to a real symbol
    MissingVeneerTarget {
        /// The expected real-symbol name
        name: String,
    },

    #[error("veneer symbol {name:?} is {size} bytes, too small to hold the target pointer at offset {offset}")]
    /// A veneer's `st_size` doesn't reach the literal-pointer slot this CPU's `veneer_symbol_offset` expects
    TruncatedVeneer {
        /// The veneer symbol's name
        name: String,
        /// `st_size` as read from the symbol table
        size: u32,
        /// The offset the embedded pointer word was expected at
        offset: u32,
    },

    #[error("cross-bank thumb branch at offset {offset:#x} has no veneer symbol {name:?}")]
    /// A Thumb branch crosses banks but no matching veneer trampoline exists
    MissingVeneer {
        /// The file offset of the branch instruction
        offset: u32,
        /// The veneer symbol name that was looked for
        name: String,
    },

    #[error("segment layout invariant violated: {reason}")]
    /// A monotonicity assertion in segment layout failed
    SegmentLayoutViolation {
        /// Human-readable description of which invariant failed
        reason: String,
    },

    #[error("PC-relative branch addend {addend} overflows the +/-2^22 range")]
    /// An undefined-symbol PC-relative branch's recovered addend exceeds the branch range
    BranchRangeOverflow {
        /// The out-of-range addend
        addend: i64,
    },
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
