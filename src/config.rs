//! Policy configuration, carried through from the CLI into the rewriter
//! policy pass. Mirrors the teacher's `Config` in `lib.rs`: a single
//! builder-constructed struct rather than scattered function arguments, so
//! the per-CPU table stays data instead of a hardcoded match.

use typed_builder::TypedBuilder;

/// Per-CPU constants the policy pass needs to reverse-engineer veneers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuConfig {
    /// Byte offset from a veneer symbol's (bit-0-cleared) `st_value` to the
    /// literal pointer word embedded in its trampoline body.
    pub veneer_symbol_offset: u32,
}

/// Look up the per-CPU configuration for a `Tag_CPU_name` string, as read
/// from `.ARM.attributes`. Returns `None` for any CPU this rewriter does not
/// carry veneer-offset data for.
pub fn cpu_config(cpu_name: &str) -> Option<CpuConfig> {
    match cpu_name {
        "6S-M" => Some(CpuConfig {
            veneer_symbol_offset: 12,
        }),
        "8-M.MAIN" => Some(CpuConfig {
            veneer_symbol_offset: 4,
        }),
        _ => None,
    }
}

/// A caller-supplied `--entry TAG SYMBOL` pair: a numeric `DT_<TAG>` and the
/// name of the dynamic symbol whose `st_value` becomes that entry's value.
#[derive(Debug, Clone)]
pub struct EntryTag {
    /// The raw dynamic-entry tag
    pub tag: u32,
    /// The symbol name to resolve against `.dynsym`
    pub symbol: String,
}

#[derive(Debug, Clone, TypedBuilder)]
/// Everything the rewriter policy pass needs beyond the loaded object graph.
pub struct Config {
    /// Delete all sections named `.debug*` (and their relocations) before
    /// running the rest of the policy pass.
    #[builder(default = false)]
    pub strip: bool,
    /// `--entry` pairs, applied in the order given
    #[builder(default, setter(into))]
    pub entries: Vec<EntryTag>,
    /// Literal string written into `.interp`, identifying the host loader
    #[builder(default = "ld_micropython".to_string(), setter(into))]
    pub interp: String,
    /// Basename of the input file, written verbatim as `DT_SONAME`'s value
    #[builder(default, setter(into))]
    pub soname: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_cpus_resolve_their_documented_offsets() {
        assert_eq!(cpu_config("6S-M").unwrap().veneer_symbol_offset, 12);
        assert_eq!(cpu_config("8-M.MAIN").unwrap().veneer_symbol_offset, 4);
    }

    #[test]
    fn unknown_cpu_resolves_to_none() {
        assert_eq!(cpu_config("Cortex-M99"), None);
    }

    #[test]
    fn config_builder_has_sensible_defaults() {
        let config = Config::builder().build();
        assert!(!config.strip);
        assert!(config.entries.is_empty());
        assert_eq!(config.interp, "ld_micropython");
        assert_eq!(config.soname, "");
    }
}
