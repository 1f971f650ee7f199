//! Error taxonomy for the patching pipeline.
//!
//! Stage-local recoverable conditions (a single authoring strategy failing)
//! are absorbed inside the authoring pipeline; everything surfaced here is
//! fatal for the whole run. Errors travel inside `anyhow::Error` and are
//! downcast at the CLI boundary for the human-readable summary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchError {
    /// Expected files or registry values were absent from the reference
    /// image. There is no safe default metadata, so this aborts the run.
    #[error("metadata extraction failed: {0}")]
    MetadataExtraction(String),

    /// Extracting or repacking a WIM container failed. The pre-existing
    /// container file is untouched because rename happens only after a
    /// successful repack.
    #[error("rebuild of {container} failed: {reason}")]
    ContainerRebuild { container: String, reason: String },

    /// Every authoring strategy failed or failed validation. Carries the
    /// per-strategy reasons so the operator can tell which tool is missing
    /// or misbehaving.
    #[error("all ISO authoring strategies failed:\n{}", .reasons.join("\n"))]
    IsoAuthoringExhausted { reasons: Vec<String> },

    /// The image at the destination failed re-validation after delivery.
    /// Authoring-time validation failures are absorbed as strategy
    /// failures instead; this variant guards the final move.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Required host tools are missing. Checked before the pipeline begins.
    #[error("missing required host tools:\n{}", .0.join("\n"))]
    MissingTools(Vec<String>),

    /// The host signalled cancellation. The in-flight external process was
    /// killed and the workspace released.
    #[error("cancelled")]
    Cancelled,
}

/// `Cancelled` must never be re-wrapped as a stage failure; callers that
/// aggregate errors check here first.
pub(crate) fn is_cancellation(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<PatchError>(), Some(PatchError::Cancelled))
}

impl PatchError {
    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            PatchError::MetadataExtraction(_) => 2,
            PatchError::ContainerRebuild { .. } => 3,
            PatchError::IsoAuthoringExhausted { .. } => 4,
            PatchError::Validation(_) => 5,
            PatchError::MissingTools(_) => 6,
            PatchError::Cancelled => 130,
        }
    }
}
