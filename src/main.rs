use std::fs;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use mkextmod::cli::Cli;
use mkextmod::config::Config;

fn run(cli: Cli) -> Result<()> {
    let input_bytes = fs::read(&cli.input)
        .with_context(|| format!("reading input object {:?}", cli.input))?;

    let soname = cli
        .input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let entries = cli.entries().map_err(|e| anyhow::anyhow!(e)).context("parsing --entry arguments")?;

    let config = Config::builder()
        .strip(cli.strip)
        .entries(entries)
        .interp(cli.interp.clone())
        .soname(soname)
        .build();

    let mut elf = mkextmod::loader::load(&input_bytes).context("loading input object")?;
    mkextmod::policy::apply(&mut elf, &config).context("applying rewriter policy")?;
    mkextmod::pipeline::run(&mut elf).context("laying out rewritten object")?;
    mkextmod::policy::finalize_footer(&mut elf);

    if cli.dump {
        print!("{}", mkextmod::dump::dump_to_string(&elf));
        return Ok(());
    }

    let output_bytes = mkextmod::pipeline::write(&mut elf).context("serializing rewritten object")?;

    let output_path = cli.output_path();
    let tmp_path = output_path.with_extension("mkextmod.tmp");
    fs::write(&tmp_path, &output_bytes)
        .with_context(|| format!("writing temporary output {tmp_path:?}"))?;
    fs::rename(&tmp_path, &output_path)
        .with_context(|| format!("renaming {tmp_path:?} to {output_path:?}"))?;

    log::info!("wrote {} bytes to {:?}", output_bytes.len(), output_path);
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.log_level_filter())
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
