//! Reference image metadata extraction.
//!
//! Reads everything the spoof needs from the Windows 10 reference ISO: the
//! volume label from the ISO 9660 descriptor, and the version strings from
//! the SOFTWARE hive inside the boot image (`sources/boot.wim`). Any missing
//! file or value is fatal; there is no safe default metadata.

use crate::error::PatchError;
use crate::extract;
use crate::iso::inspect;
use crate::policy::PatchPolicy;
use crate::process::{CancelFlag, ToolRunner};
use crate::registry::CURRENT_VERSION_KEY;
use crate::wim;
use crate::workspace::BuildWorkspace;
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;

/// Version values read from `SOFTWARE\Microsoft\Windows NT\CurrentVersion`
/// and later spoofed into the target image, in plan order.
pub const VERSION_VALUE_NAMES: &[&str] = &[
    "ProductName",
    "EditionID",
    "CurrentBuild",
    "CurrentBuildNumber",
    "CurrentVersion",
];

/// Candidate paths of the boot image inside an ISO; mastering tools differ
/// in case.
const BOOT_WIM_CANDIDATES: &[&str] = &["sources/boot.wim", "SOURCES/BOOT.WIM"];

/// Everything extracted from the reference image. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMetadata {
    pub product_name: String,
    pub edition_id: String,
    pub build_number: String,
    pub volume_label: String,
    pub registry_values: BTreeMap<String, String>,
}

/// Extract [`SourceMetadata`] from the reference (Windows 10) ISO.
pub fn extract_source_metadata(
    runner: &dyn ToolRunner,
    ws: &BuildWorkspace,
    reference_iso: &Path,
    cancel: &CancelFlag,
    policy: &PatchPolicy,
) -> Result<SourceMetadata> {
    cancel.check()?;

    let volume_label = inspect::read_volume_label(reference_iso)?.ok_or_else(|| {
        PatchError::MetadataExtraction(format!(
            "'{}' carries no readable ISO 9660 volume descriptor",
            reference_iso.display()
        ))
    })?;
    if volume_label.is_empty() {
        return Err(PatchError::MetadataExtraction(format!(
            "'{}' has an empty volume label",
            reference_iso.display()
        ))
        .into());
    }

    let scratch = ws.subdir("reference")?;
    let boot_wim = extract::extract_file(
        runner,
        reference_iso,
        BOOT_WIM_CANDIDATES,
        &scratch,
        cancel,
        policy,
    )
    .map_err(|e| PatchError::MetadataExtraction(format!("boot.wim not extractable: {e:#}")))?;

    cancel.check()?;

    // The SOFTWARE hive of the first boot image carries the version strings
    // Boot Camp Assistant is spoofed with.
    let hive_dir = ws.subdir("reference/hive")?;
    let software_hive = wim::extract_single_path(
        runner,
        &boot_wim,
        1,
        "/Windows/System32/config/SOFTWARE",
        &hive_dir,
        cancel,
        policy,
    )
    .map_err(|e| {
        PatchError::MetadataExtraction(format!("SOFTWARE hive not extractable: {e:#}"))
    })?;

    let values = crate::registry::read_key_values(
        runner,
        &software_hive,
        CURRENT_VERSION_KEY,
        &scratch,
        cancel,
        policy,
    )?
    .ok_or_else(|| {
        PatchError::MetadataExtraction(format!(
            "key {} missing from reference SOFTWARE hive",
            CURRENT_VERSION_KEY
        ))
    })?;

    let mut registry_values = BTreeMap::new();
    for name in VERSION_VALUE_NAMES {
        let value = values
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, literal)| literal.strip_prefix("string:"))
            .map(str::to_string)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                PatchError::MetadataExtraction(format!(
                    "value '{}' missing or empty in reference SOFTWARE hive",
                    name
                ))
            })?;
        registry_values.insert((*name).to_string(), value);
    }

    Ok(SourceMetadata {
        product_name: registry_values["ProductName"].clone(),
        edition_id: registry_values["EditionID"].clone(),
        build_number: registry_values["CurrentBuild"].clone(),
        volume_label,
        registry_values,
    })
}
