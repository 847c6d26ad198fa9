// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::cli::{patch, verify};

#[derive(Debug, Subcommand)]
pub enum Command {
    Patch(patch::PatchCli),
    Verify(verify::VerifyCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug logging.
    ///
    /// The RUST_LOG environment variable takes precedence.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

fn init_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { Level::DEBUG } else { Level::INFO };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set default tracing subscriber")
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;
    logging_initialized.store(true, Ordering::SeqCst);

    match cli.command {
        Command::Patch(c) => patch::patch_main(&c, cancel_signal),
        Command::Verify(c) => verify::verify_main(&c, cancel_signal),
    }
}
