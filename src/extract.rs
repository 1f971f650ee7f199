//! ISO content extraction.
//!
//! Delegates to whichever extraction tool the host has, in fixed order:
//! `xorriso` (osirrox mode), then `bsdtar`. Both understand ISO 9660 with
//! Joliet/Rock Ridge and UDF-bridge images, which covers Microsoft media.
//! Per-tool failures are collected and reported together when every tool
//! fails.

use crate::policy::PatchPolicy;
use crate::process::{CancelFlag, Invocation, ToolRunner};
use anyhow::{bail, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Extract the full contents of an ISO into `dest`.
pub fn extract_iso(
    runner: &dyn ToolRunner,
    iso: &Path,
    dest: &Path,
    cancel: &CancelFlag,
    policy: &PatchPolicy,
) -> Result<()> {
    fs::create_dir_all(dest)?;
    let mut reasons = Vec::new();

    if runner.is_available("xorriso") {
        let inv = Invocation::new(
            "xorriso",
            [
                "-osirrox",
                "on",
                "-indev",
                &iso.to_string_lossy(),
                "-extract",
                "/",
                &dest.to_string_lossy(),
            ],
        );
        let result = runner.run(&inv, cancel, policy.tool_timeout())?;
        if result.success {
            return Ok(());
        }
        reasons.push(format!("xorriso: {}", result.failure_reason()));
    } else {
        reasons.push("xorriso: not installed".to_string());
    }

    if runner.is_available("bsdtar") {
        let iso_arg = iso.to_string_lossy();
        let dest_arg = dest.to_string_lossy();
        let inv = Invocation::new(
            "bsdtar",
            ["-x", "-f", iso_arg.as_ref(), "-C", dest_arg.as_ref()],
        );
        let result = runner.run(&inv, cancel, policy.tool_timeout())?;
        if result.success {
            return Ok(());
        }
        reasons.push(format!("bsdtar: {}", result.failure_reason()));
    } else {
        reasons.push("bsdtar: not installed".to_string());
    }

    bail!(
        "extracting '{}' failed with every tool:\n  {}",
        iso.display(),
        reasons.join("\n  ")
    );
}

/// Extract a single file out of an ISO, trying each candidate inner path
/// (ISO directory trees differ in case between mastering tools).
///
/// Returns the path of the extracted file under `dest_dir`.
pub fn extract_file(
    runner: &dyn ToolRunner,
    iso: &Path,
    inner_candidates: &[&str],
    dest_dir: &Path,
    cancel: &CancelFlag,
    policy: &PatchPolicy,
) -> Result<PathBuf> {
    fs::create_dir_all(dest_dir)?;
    let mut reasons = Vec::new();

    for inner in inner_candidates {
        if runner.is_available("xorriso") {
            let out = dest_dir.join(file_name_of(inner));
            let inv = Invocation::new(
                "xorriso",
                [
                    "-osirrox",
                    "on",
                    "-indev",
                    &iso.to_string_lossy(),
                    "-extract",
                    &format!("/{}", inner),
                    &out.to_string_lossy(),
                ],
            );
            let result = runner.run(&inv, cancel, policy.tool_timeout())?;
            if result.success && is_non_empty_file(&out) {
                return Ok(out);
            }
            reasons.push(format!("xorriso /{}: {}", inner, result.failure_reason()));
        }

        if runner.is_available("bsdtar") {
            let iso_arg = iso.to_string_lossy();
            let dest_arg = dest_dir.to_string_lossy();
            let inv = Invocation::new(
                "bsdtar",
                ["-x", "-f", iso_arg.as_ref(), "-C", dest_arg.as_ref(), inner],
            );
            let result = runner.run(&inv, cancel, policy.tool_timeout())?;
            let out = dest_dir.join(inner);
            if result.success && is_non_empty_file(&out) {
                return Ok(out);
            }
            reasons.push(format!("bsdtar {}: {}", inner, result.failure_reason()));
        }
    }

    if reasons.is_empty() {
        reasons.push("no extraction tool installed".to_string());
    }
    bail!(
        "extracting a file from '{}' failed:\n  {}",
        iso.display(),
        reasons.join("\n  ")
    );
}

fn file_name_of(inner: &str) -> &str {
    inner.rsplit('/').next().unwrap_or(inner)
}

fn is_non_empty_file(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

/// Locate a file by name anywhere under `root`, case-insensitively.
/// Mastering tools disagree about case, so a fixed path cannot be trusted.
pub fn find_file(root: &Path, name: &str) -> Option<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| {
            e.file_type().is_file()
                && e.file_name()
                    .to_string_lossy()
                    .eq_ignore_ascii_case(name)
        })
        .map(|e| e.into_path())
}

/// Number of regular files under `root`.
pub fn count_files(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count() as u64
}

/// Total size in bytes of all regular files under `root`.
pub fn tree_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ExitResult;
    use crate::testing::ScriptedRunner;
    use tempfile::TempDir;

    #[test]
    fn extraction_tries_every_tool_and_collects_reasons() {
        let temp = TempDir::new().unwrap();
        let iso = temp.path().join("in.iso");
        fs::write(&iso, b"not really an iso").unwrap();

        let runner = ScriptedRunner::new()
            .expect(|_| Ok(ExitResult::failed("bad superblock")))
            .expect(|_| Ok(ExitResult::failed("unrecognized archive format")));

        let err = extract_iso(
            &runner,
            &iso,
            &temp.path().join("out"),
            &CancelFlag::new(),
            &PatchPolicy::default(),
        )
        .unwrap_err();

        let msg = format!("{err:#}");
        assert!(msg.contains("xorriso: exit code 1: bad superblock"));
        assert!(msg.contains("bsdtar: exit code 1: unrecognized archive format"));
        assert_eq!(runner.remaining(), 0);
    }

    #[test]
    fn single_file_extraction_returns_the_extracted_path() {
        let temp = TempDir::new().unwrap();
        let iso = temp.path().join("in.iso");
        fs::write(&iso, b"iso").unwrap();
        let dest = temp.path().join("scratch");

        let runner = ScriptedRunner::new().expect(|inv| {
            let out = PathBuf::from(inv.args.last().unwrap());
            fs::write(&out, b"boot wim bytes").unwrap();
            Ok(ExitResult::ok(""))
        });

        let out = extract_file(
            &runner,
            &iso,
            &["sources/boot.wim"],
            &dest,
            &CancelFlag::new(),
            &PatchPolicy::default(),
        )
        .unwrap();
        assert_eq!(out, dest.join("boot.wim"));
        assert_eq!(fs::read(&out).unwrap(), b"boot wim bytes");
    }

    #[test]
    fn finds_files_case_insensitively() {
        let temp = TempDir::new().unwrap();
        let sources = temp.path().join("SOURCES");
        fs::create_dir_all(&sources).unwrap();
        fs::write(sources.join("BOOT.WIM"), b"wim").unwrap();

        let found = find_file(temp.path(), "boot.wim").unwrap();
        assert!(found.ends_with("SOURCES/BOOT.WIM"));
        assert!(find_file(temp.path(), "install.wim").is_none());
    }

    #[test]
    fn tree_size_sums_files() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a"), vec![0u8; 10]).unwrap();
        fs::create_dir(temp.path().join("d")).unwrap();
        fs::write(temp.path().join("d/b"), vec![0u8; 32]).unwrap();

        assert_eq!(tree_size(temp.path()), 42);
        assert_eq!(count_files(temp.path()), 2);
    }
}
