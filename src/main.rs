//! Main entry point for the sfx CLI application.
//!
//! The same binary builds archives and runs them: with no payload attached
//! it packs a directory behind a copy of itself, and with a payload it
//! unpacks to a temp dir and runs the embedded script.

use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sfx::{Builder, Cli, Extractor, Mode, SfxError, detect_mode};

/// Application entry point.
///
/// Errors are reported on stdout with an `ERROR:` prefix and turn into a
/// non-zero exit status.
#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<SfxError>() {
                Some(usage @ SfxError::Usage { .. }) => println!("{}", usage),
                _ => println!("ERROR: {:#}", err),
            }
            ExitCode::FAILURE
        }
    }
}

/// Detect the mode from our own bytes and dispatch to the builder or extractor.
async fn run(cli: Cli) -> Result<()> {
    let exe = std::env::current_exe()?;
    info!("Executable: {}", exe.display());

    match detect_mode(&exe).await? {
        Mode::Build => {
            let args = cli.build_args().ok_or_else(|| SfxError::Usage {
                exe: program_name(),
            })?;
            let builder = Builder::new(exe, args.target, args.dir, args.script);
            let report = tokio::task::spawn_blocking(move || builder.build()).await??;
            info!(
                "Archive starts at offset {}, {} entries, {} bytes",
                report.data_start, report.entries, report.total_size
            );
        }
        Mode::Extract(archive) => {
            Extractor::new(archive).run(&cli.args).await?;
        }
    }

    Ok(())
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `-v` raises the level to debug so
/// per-entry paths and sizes are shown. Colour only when stdout is a terminal.
fn init_logging(verbose: bool) {
    let default = if verbose { "sfx=debug" } else { "sfx=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_ansi(std::io::stdout().is_terminal())
        .with_writer(std::io::stdout)
        .init();
}

/// Name the binary was invoked as, for the usage line
fn program_name() -> String {
    std::env::args().next().unwrap_or_else(|| "sfx".to_string())
}
