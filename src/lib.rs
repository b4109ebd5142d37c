//! imgforge - appliance image builder for embedded targets
//!
//! Compiles a declarative storage layout into device image files, a
//! generated fstab and an installer action program the target's restore
//! tooling replays at install time.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`cli`] - Command-line interface parsing and dispatch
//! - [`spec`] - The declarative layout data model
//! - [`layout`] - Partition table compilation and sector arithmetic
//! - [`device`] - Per-device build behavior (partitions, raw disks, UBI, NAND files)
//! - [`installer`] - Installer action program compilation
//! - [`pipeline`] - The end-to-end image build pipeline
//! - [`infra`] - Infrastructure layer (external tools, loop devices, filesystem)
//! - [`config`] - Constants and fixed policy
//! - [`error`] - Error types and handling

pub mod cli;
pub mod config;
pub mod device;
pub mod error;
pub mod infra;
pub mod installer;
pub mod layout;
pub mod pipeline;
pub mod spec;
