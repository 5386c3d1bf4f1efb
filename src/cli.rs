//! Command-line surface: argument parsing and the small bits of policy
//! (output path defaulting, verbosity-to-log-level mapping) that belong to
//! the binary rather than the library.

use std::path::PathBuf;

use clap::Parser;

use crate::config::EntryTag;

/// Rewrite a relocatable ARM object into a dynamically-loadable extension module.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Input relocatable ELF object
    pub input: PathBuf,

    /// Output path; defaults to overwriting the input file in place
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Strip `.debug*` sections (and their relocations) before rewriting
    #[arg(long)]
    pub strip: bool,

    /// String written into `.interp`
    #[arg(long, default_value = "ld_micropython")]
    pub interp: String,

    /// Add a `DT_<TAG>` entry pointing at a symbol's resolved value: TAG (hex)
    /// and SYMBOL as two separate arguments, repeatable, e.g.
    /// `--entry 7E000000 app_main`
    #[arg(long = "entry", num_args = 2, value_names = ["TAG", "SYMBOL"], action = clap::ArgAction::Append)]
    pub entry_args: Vec<String>,

    /// Print the rewritten object graph's sections and segments instead of
    /// writing the output file
    #[arg(long)]
    pub dump: bool,

    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Decrease log verbosity (repeatable)
    #[arg(short = 'q', long, action = clap::ArgAction::Count)]
    pub quiet: u8,
}

impl Cli {
    /// The path to write the rewritten object to; the input path if `--output`
    /// was not given.
    pub fn output_path(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| self.input.clone())
    }

    /// Parse `--entry TAG SYMBOL` pairs collected in `entry_args`. `num_args
    /// = 2` guarantees `entry_args` always holds a whole number of pairs.
    pub fn entries(&self) -> Result<Vec<EntryTag>, String> {
        self.entry_args
            .chunks_exact(2)
            .map(|pair| {
                let tag = u32::from_str_radix(pair[0].trim_start_matches("0x"), 16)
                    .map_err(|e| format!("invalid hex dynamic-entry tag {:?}: {e}", pair[0]))?;
                Ok(EntryTag {
                    tag,
                    symbol: pair[1].clone(),
                })
            })
            .collect()
    }

    /// Map `-v`/`-q` counts onto a `log` level, defaulting to `Info`.
    pub fn log_level_filter(&self) -> log::LevelFilter {
        let base = 2i32 + self.verbose as i32 - self.quiet as i32;
        match base {
            i32::MIN..=0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Warn,
            2 => log::LevelFilter::Info,
            3 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}
