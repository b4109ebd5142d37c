//! Infrastructure layer
//!
//! Handles all I/O operations: external processes, loop devices, and the
//! filesystem. This module is the only place where side effects occur;
//! the partitioning/formatting/mounting tools behind the [`tools`] traits
//! can be swapped for fakes in tests.

pub mod filesystem;
pub mod loopdev;
pub mod process;
pub mod tools;
