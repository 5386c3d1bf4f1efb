//! `mkextmod`: rewrites a statically-linked ARM relocatable object (as
//! produced by `-r`/partial linking) into a dynamically-loadable extension
//! module, synthesizing the minimal dynamic-linking metadata a small
//! embedded loader needs to resolve it against a host image at load time.

pub mod cli;
pub mod config;
pub mod consts;
pub mod dump;
pub mod error;
pub mod loader;
pub mod model;
pub mod pipeline;
pub mod policy;
pub mod raw;
pub mod strtab;
pub mod visitor;

pub use config::Config;
pub use error::{Error, Result};

/// Run the full rewrite: load, apply policy, lay out, stamp the footer, and
/// serialize. This is the single entry point [`crate::cli`]'s binary drives;
/// tests exercise it directly against hand-built or fixture object bytes.
pub fn transform(input: &[u8], config: &Config) -> Result<Vec<u8>> {
    let mut elf = loader::load(input)?;
    policy::apply(&mut elf, config)?;
    pipeline::run(&mut elf)?;
    policy::finalize_footer(&mut elf);
    pipeline::write(&mut elf)
}
