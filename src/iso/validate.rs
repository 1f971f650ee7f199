//! Validation of produced images.
//!
//! Cheap checks only: file size against a truncation threshold, presence of
//! an ISO 9660 signature, and the volume label. No full mount. A failed size
//! or structure check makes the pipeline treat the just-succeeded authoring
//! strategy as failed retroactively; a label mismatch is a warning only,
//! since some authoring tools normalize labels.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;

use super::inspect;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ValidationResult {
    pub size_ok: bool,
    pub structure_ok: bool,
    pub volume_label_ok: bool,
    pub overall_pass: bool,
}

/// Validate a produced image.
///
/// `expected_min_bytes` is derived from the source tree size by policy;
/// anything smaller is treated as truncated output.
pub fn validate_image(
    image: &Path,
    expected_min_bytes: u64,
    expected_label: &str,
) -> Result<ValidationResult> {
    let size = fs::metadata(image)
        .with_context(|| format!("reading size of produced image '{}'", image.display()))?
        .len();
    let size_ok = size >= expected_min_bytes;

    let pvd = inspect::read_pvd(image)?;
    let structure_ok = pvd.is_some();
    let volume_label_ok = pvd
        .map(|p| p.volume_label.eq_ignore_ascii_case(expected_label.trim()))
        .unwrap_or(false);

    Ok(ValidationResult {
        size_ok,
        structure_ok,
        volume_label_ok,
        overall_pass: size_ok && structure_ok,
    })
}
