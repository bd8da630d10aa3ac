//! Hutch CLI entry point.

use clap::Parser;
use color_eyre::eyre::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use hutch::cli::{Cli, Commands, LogFormat};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // The helper unshares namespaces, so it must stay single threaded.
    if matches!(cli.command, Commands::Init) {
        std::process::exit(hutch::exec::init_main());
    }

    // Initialize error handling
    color_eyre::install()?;

    // Initialize tracing
    let directive = if cli.debug { "hutch=debug" } else { "hutch=info" };
    let filter = EnvFilter::from_default_env().add_directive(directive.parse()?);
    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init(),
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    // Execute command
    let code = runtime.block_on(cli.execute())?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
