//! Unified error handling for the engine.
//!
//! Unmappable trip records are not errors (they are counted and dropped by
//! the aggregator); everything that can actually fail an operation is a
//! variant here. The pipeline treats [`EngineError::Checkpoint`] and
//! [`EngineError::Snapshot`] as fatal for the run and everything else as a
//! per-batch failure.

use std::path::PathBuf;

use thiserror::Error;

/// Unified error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A batch already present in the processing ledger was submitted for
    /// merging again. Re-applying a merged batch would double-count
    /// attempts, so the engine refuses instead of silently skipping.
    #[error("batch '{batch_id}' is already recorded in the processing ledger")]
    BatchAlreadyProcessed { batch_id: String },

    /// Reading or writing a checkpoint file failed.
    #[error("checkpoint I/O failed for {}: {source}", .path.display())]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Snapshot encoding or decoding failed.
    #[error("snapshot serialization failed: {0}")]
    Snapshot(#[from] serde_json::Error),

    /// A persisted snapshot was structurally valid JSON but not a shape
    /// this crate knows how to load.
    #[error("unrecognized snapshot format in {}: {message}", .path.display())]
    SnapshotFormat { path: PathBuf, message: String },

    /// A batch source collaborator (listing or fetch) failed.
    #[error("batch source failure: {message}")]
    Source { message: String },
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
