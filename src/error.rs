//! Error types for imgforge
//!
//! Domain-specific error types using thiserror.

use std::path::PathBuf;
use thiserror::Error;

/// Image specification errors
///
/// Raised when the declared spec references a field combination the
/// compiler cannot reconcile.
#[derive(Error, Debug)]
pub enum SpecError {
    /// Read-only flag on a tree that must stay writable
    #[error("'{mountpoint}' cannot be read-only: /var, /recovery and their children must stay writable")]
    ReadOnlyVarTree { mountpoint: String },

    /// Unknown additional action type
    #[error("Additional action '{action}' is not defined")]
    UnknownAction { action: String },

    /// Spec document could not be parsed
    #[error("Failed to parse image spec: {source}")]
    Parse { source: serde_json::Error },

    /// A device declaration is missing a field its variant requires
    #[error("Device '{device}' is missing required field '{field}'")]
    MissingField { device: String, field: String },
}

/// Storage layout errors
#[derive(Error, Debug)]
pub enum LayoutError {
    /// More than 3 primary partitions requested next to an extended region
    #[error(
        "More than 4 primary partitions requested on device {device}. Declare a maximum of \
         3 primary partitions and any number of logical ones in an msdos partition table"
    )]
    PrimaryOverflow { device: String },

    /// Install device node ends in something that is not a partition number
    #[error("Install device '{device}' is malformatted: cannot parse a partition number suffix")]
    MalformedDeviceNode { device: String },

    /// Explicit sectors going backwards
    #[error(
        "Sector ordering is wrong for partition '{partition}': start sector {requested} is \
         below the minimum start {minimum}"
    )]
    SectorOrder {
        partition: String,
        requested: u64,
        minimum: u64,
    },

    /// Explicit partition type string is not one of primary/extended/logical
    #[error("'{value}' is not a valid partition type. Valid types are: primary, extended, logical")]
    InvalidPartitionType { value: String },

    /// Partitions on one device node disagree on the table kind
    #[error("Device '{device}' mixes msdos and gpt partition declarations")]
    TableKindMismatch { device: String },
}

/// File extraction errors raised while populating raw/NAND devices
#[derive(Error, Debug)]
pub enum ExtractionError {
    /// Extracted file exceeds its declared maximum size
    #[error("Extracted file '{file}' is of size {size}, which is bigger than {max_size}. Aborting")]
    FileTooBig {
        file: PathBuf,
        size: u64,
        max_size: u64,
    },

    /// Flash source does not fit the target partition
    #[error("File '{file}' is of size {size}, too big for partition of {capacity} bytes")]
    PartitionOverflow {
        file: PathBuf,
        size: u64,
        capacity: u64,
    },

    /// Flash target partition name not present in the committed table
    #[error("Partition '{name}' not found in the partition table of {image}")]
    PartitionNotFound { name: String, image: PathBuf },

    /// IO error while writing into the raw image
    #[error("IO error for '{path}': {error}")]
    Io { path: PathBuf, error: String },
}

/// External tool invocation errors
#[derive(Error, Debug)]
pub enum ToolError {
    /// Tool could not be spawned at all
    #[error("Failed to run '{tool}': {error}")]
    Spawn { tool: String, error: String },

    /// Tool exited with a non-zero status
    #[error("'{tool}' failed with status {status}: {stderr}")]
    Failed {
        tool: String,
        status: i32,
        stderr: String,
    },

    /// Required tool is not installed
    #[error("Required tool '{tool}' is not installed or not in PATH")]
    NotFound { tool: String },

    /// Tool produced output we cannot interpret
    #[error("Unexpected output from '{tool}': {detail}")]
    UnexpectedOutput { tool: String, detail: String },
}

/// Filesystem errors
#[derive(Error, Debug)]
pub enum FilesystemError {
    /// Failed to create directory
    #[error("Failed to create directory '{path}': {error}")]
    CreateDir { path: PathBuf, error: String },

    /// Failed to remove directory
    #[error("Failed to remove directory '{path}': {error}")]
    RemoveDir { path: PathBuf, error: String },

    /// Failed to write file
    #[error("Failed to write file '{path}': {error}")]
    WriteFile { path: PathBuf, error: String },

    /// Failed to read file
    #[error("Failed to read file '{path}': {error}")]
    ReadFile { path: PathBuf, error: String },

    /// Failed to rename file
    #[error("Failed to rename '{from}' to '{to}': {error}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        error: String,
    },
}

/// Top-level imgforge error type
#[derive(Error, Debug)]
pub enum BuildError {
    /// Spec error
    #[error("Spec error: {0}")]
    Spec(#[from] SpecError),

    /// Layout error
    #[error("Layout error: {0}")]
    Layout(#[from] LayoutError),

    /// Extraction error
    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    /// External tool error
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// Filesystem error
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] FilesystemError),

    /// IO error
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Installer program or metadata serialization error
    #[error("Serialization error: {source}")]
    Serialize {
        #[from]
        source: serde_json::Error,
    },
}
