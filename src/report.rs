//! Machine-readable run report.
//!
//! Written beside the output image after a successful run. Records what was
//! spoofed, which authoring strategy won after how many attempts, the
//! validation outcome, and a digest of the produced image so the output can
//! be re-verified later without re-running anything.

use crate::iso::validate::ValidationResult;
use crate::iso::AuthoringAttempt;
use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: String,
    pub finished_at: String,
    pub target_iso: PathBuf,
    pub reference_iso: PathBuf,
    pub output_iso: PathBuf,
    pub spoofed_product_name: String,
    pub spoofed_build_number: String,
    pub volume_label: String,
    pub install_images_spoofed: u32,
    pub authoring_strategy: String,
    pub authoring_attempts: Vec<AuthoringAttempt>,
    pub validation: ValidationResult,
    pub output_size_bytes: u64,
    pub output_sha256: String,
}

impl RunReport {
    /// Write the report as pretty-printed JSON beside the output image.
    /// Returns the report path.
    pub fn write_beside(&self, output_iso: &Path) -> Result<PathBuf> {
        let path = report_path(output_iso);
        let json = serde_json::to_string_pretty(self).context("serializing run report")?;
        fs::write(&path, json)
            .with_context(|| format!("writing run report '{}'", path.display()))?;
        Ok(path)
    }
}

fn report_path(output_iso: &Path) -> PathBuf {
    output_iso.with_extension("report.json")
}

/// Current wall-clock time as an RFC 3339 string for report fields.
pub fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// SHA-256 of a file, streamed.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file =
        File::open(path).with_context(|| format!("opening '{}' for hashing", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
