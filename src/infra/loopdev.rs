//! Scoped loop-device bindings
//!
//! A build holds at most one binding at a time, acquired around each
//! formatting step and released on every exit path.

use std::path::{Path, PathBuf};

use crate::error::ToolError;

use super::tools::LoopMounter;

/// A live loop binding. Dropping it detaches best-effort; call
/// [`LoopBinding::detach`] to observe the result.
pub struct LoopBinding<'a> {
    mounter: &'a dyn LoopMounter,
    node: PathBuf,
    detached: bool,
}

impl<'a> LoopBinding<'a> {
    /// Attach a file, or a byte range of it, to a free loop device
    pub fn attach(
        mounter: &'a dyn LoopMounter,
        file: &Path,
        offset: Option<u64>,
        size_limit: Option<u64>,
    ) -> Result<Self, ToolError> {
        let node = mounter.attach(file, offset, size_limit)?;
        tracing::debug!("Attached {} to {}", file.display(), node.display());
        Ok(LoopBinding {
            mounter,
            node,
            detached: false,
        })
    }

    /// The granted loop node
    pub fn node(&self) -> &Path {
        &self.node
    }

    /// Release the binding, surfacing the detach failure if any
    pub fn detach(mut self) -> Result<(), ToolError> {
        self.detached = true;
        self.mounter.detach(&self.node)
    }
}

impl Drop for LoopBinding<'_> {
    fn drop(&mut self) {
        if !self.detached {
            if let Err(e) = self.mounter.detach(&self.node) {
                tracing::warn!("Failed to detach {}: {}", self.node.display(), e);
            }
        }
    }
}
