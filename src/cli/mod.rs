//! Command-line interface module
//!
//! This module handles argument parsing and dispatch. It contains no
//! business logic - that belongs in the [`crate::pipeline`] and
//! [`crate::installer`] modules.

pub mod commands;

use anyhow::Result;
use clap::Parser;

use commands::Commands;

/// imgforge - appliance image builder for embedded targets
///
/// Compile a declarative storage layout into device images, a generated
/// fstab and an installer action program.
#[derive(Parser, Debug)]
#[command(name = "imgforge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Execute the CLI command
    pub fn run(self) -> Result<()> {
        if let Some(cmd) = self.command {
            cmd.run()
        } else {
            // No subcommand provided, show help
            use clap::CommandFactory;
            let mut cmd = Self::command();
            cmd.print_help()?;
            Ok(())
        }
    }

    /// Log filter level implied by the verbosity flags
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else {
            match self.verbose {
                0 => tracing::Level::WARN,
                1 => tracing::Level::INFO,
                _ => tracing::Level::DEBUG,
            }
        }
    }
}
