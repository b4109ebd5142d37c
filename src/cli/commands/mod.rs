//! CLI command implementations
//!
//! Each command is implemented in its own submodule.

pub mod build;
pub mod check;
pub mod inspect;

use std::path::PathBuf;

use anyhow::Result;
use clap::Subcommand;

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build device images from a layout and a rootfs archive
    Build {
        /// Path to the image layout file (JSON)
        layout: PathBuf,

        /// Rootfs archive to unpack into the image (.tar, .tar.gz, .tar.xz, .tar.zst)
        rootfs: PathBuf,

        /// Appliance variant appended to the image name
        #[arg(long)]
        variant: Option<String>,

        /// Appliance version stamped into the image name and metadata
        #[arg(long)]
        version: Option<String>,

        /// Directory the build tree is created under
        #[arg(short, long, default_value = ".")]
        work_dir: PathBuf,

        /// Package listing file embedded in the image metadata
        #[arg(long)]
        packages: Option<PathBuf>,

        /// Compress artifacts even if the layout does not ask for it
        #[arg(long)]
        compress: bool,
    },

    /// Compile and print the installer program without building images
    Inspect {
        /// Path to the image layout file (JSON)
        layout: PathBuf,

        /// Appliance variant appended to the image name
        #[arg(long)]
        variant: Option<String>,

        /// Appliance version
        #[arg(long)]
        version: Option<String>,

        /// Compact single-line JSON instead of pretty-printed
        #[arg(long)]
        compact: bool,
    },

    /// Validate a layout file without building
    Check {
        /// Path to the image layout file (JSON)
        layout: PathBuf,
    },
}

impl Commands {
    /// Run the command
    pub fn run(self) -> Result<()> {
        match self {
            Commands::Build {
                layout,
                rootfs,
                variant,
                version,
                work_dir,
                packages,
                compress,
            } => build::execute(build::BuildArgs {
                layout,
                rootfs,
                variant,
                version,
                work_dir,
                packages,
                compress,
            }),
            Commands::Inspect {
                layout,
                variant,
                version,
                compact,
            } => inspect::execute(&layout, variant.as_deref(), version.as_deref(), compact),
            Commands::Check { layout } => check::execute(&layout),
        }
    }
}
