//! keller CLI entry point.

use std::process::ExitCode;

use clap::Parser;
use color_eyre::eyre::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use keller::cli::Cli;

fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let default = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(default.parse()?))
        .init();

    let code = cli.execute()?;
    Ok(ExitCode::from(code as u8))
}
