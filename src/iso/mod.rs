//! ISO authoring: strategies, fallback, and validation.
//!
//! Authoring is the flakiest stage of the whole pipeline, so it runs as an
//! ordered list of strategies, each tried exactly once. A strategy only
//! counts as successful when its output also passes validation; a tool that
//! exits 0 but writes a truncated image falls through to the next strategy
//! like any other failure. When every strategy fails, all collected reasons
//! are reported together.
//!
//! The final strategy is a built-in ISO 9660 writer, so authoring can
//! succeed on a host with no mastering tool installed at all.

use crate::error::{is_cancellation, PatchError};
use crate::extract;
use crate::policy::PatchPolicy;
use crate::process::{CancelFlag, Invocation, ToolRunner};
use crate::progress::{Progress, StageEvent};
use anyhow::Result;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

pub mod inspect;
pub mod validate;
pub mod writer;

use validate::ValidationResult;

/// BIOS boot sector file inside Windows installation media.
const BIOS_BOOT_IMAGE: &str = "boot/etfsboot.com";

/// EFI boot image inside Windows installation media.
const EFI_BOOT_IMAGE: &str = "efi/microsoft/boot/efisys.bin";

/// Everything a strategy needs to author one image.
#[derive(Debug, Clone)]
pub struct AuthoringRequest {
    pub source_dir: PathBuf,
    pub output: PathBuf,
    pub volume_label: String,
    pub application_id: String,
    pub publisher: String,
}

enum StrategyKind {
    External {
        tool: &'static str,
        build_args: fn(&AuthoringRequest) -> Vec<String>,
    },
    Builtin,
}

pub struct Strategy {
    pub name: &'static str,
    kind: StrategyKind,
}

/// The fixed strategy order. Most capable first; the built-in writer last.
pub fn strategies() -> Vec<Strategy> {
    vec![
        Strategy {
            name: "mkisofs (UDF, dual boot)",
            kind: StrategyKind::External {
                tool: "mkisofs",
                build_args: dual_boot_args,
            },
        },
        Strategy {
            name: "mkisofs (basic)",
            kind: StrategyKind::External {
                tool: "mkisofs",
                build_args: basic_args,
            },
        },
        Strategy {
            name: "genisoimage",
            kind: StrategyKind::External {
                tool: "genisoimage",
                build_args: basic_args,
            },
        },
        Strategy {
            name: "built-in writer",
            kind: StrategyKind::Builtin,
        },
    ]
}

/// Full UDF-bridge media with both BIOS and EFI El Torito entries, the way
/// Microsoft masters its own ISOs.
fn dual_boot_args(req: &AuthoringRequest) -> Vec<String> {
    [
        "-iso-level",
        "3",
        "-udf",
        "-V",
        &req.volume_label,
        "-A",
        &req.application_id,
        "-publisher",
        &req.publisher,
        "-b",
        BIOS_BOOT_IMAGE,
        "-no-emul-boot",
        "-boot-load-size",
        "4",
        "-boot-info-table",
        "-eltorito-alt-boot",
        "-no-emul-boot",
        "-b",
        EFI_BOOT_IMAGE,
        "-o",
        &req.output.to_string_lossy(),
        &req.source_dir.to_string_lossy(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Plain Joliet/Rock Ridge image without boot entries; still installable
/// from within a running system even if not BIOS-bootable.
fn basic_args(req: &AuthoringRequest) -> Vec<String> {
    [
        "-J",
        "-r",
        "-allow-lowercase",
        "-allow-multidot",
        "-V",
        &req.volume_label,
        "-o",
        &req.output.to_string_lossy(),
        &req.source_dir.to_string_lossy(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// One authoring attempt, kept for the run report.
#[derive(Debug, Clone, Serialize)]
pub struct AuthoringAttempt {
    pub strategy: &'static str,
    pub started_at: String,
    pub duration_ms: u64,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded {
        size_bytes: u64,
        validation: ValidationResult,
    },
    Failed {
        reason: String,
    },
}

/// Result of a successful authoring run.
#[derive(Debug, Clone)]
pub struct AuthoringOutcome {
    pub attempts: Vec<AuthoringAttempt>,
    pub strategy: &'static str,
    pub size_bytes: u64,
    pub validation: ValidationResult,
}

/// Author an image from `req.source_dir`, walking the strategy list until
/// one produces a validating image.
///
/// Fails with [`PatchError::IsoAuthoringExhausted`] carrying every
/// per-strategy reason when no strategy succeeds.
pub fn author_iso(
    runner: &dyn ToolRunner,
    req: &AuthoringRequest,
    cancel: &CancelFlag,
    policy: &PatchPolicy,
    progress: &dyn Progress,
) -> Result<AuthoringOutcome> {
    let source_bytes = extract::tree_size(&req.source_dir);
    let min_bytes = policy.min_output_bytes(source_bytes);
    let boot_present = extract::find_file(&req.source_dir, "etfsboot.com").is_some();

    let all = strategies();
    let total = all.len();
    let mut attempts: Vec<AuthoringAttempt> = Vec::new();
    let mut reasons: Vec<String> = Vec::new();

    for (index, strategy) in all.into_iter().enumerate() {
        cancel.check()?;
        progress.event(&StageEvent::StrategyStarted {
            strategy: strategy.name,
            index: index + 1,
            total,
        });

        let started_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let clock = std::time::Instant::now();

        let failure = match run_strategy(runner, &strategy, req, boot_present, cancel, policy) {
            Ok(None) => match check_output(req, min_bytes)? {
                Ok(validation) => {
                    let size_bytes = fs::metadata(&req.output)?.len();
                    progress.event(&StageEvent::IsoAuthored {
                        strategy: strategy.name,
                        size_bytes,
                    });
                    progress.event(&StageEvent::Validated { result: validation });
                    attempts.push(AuthoringAttempt {
                        strategy: strategy.name,
                        started_at,
                        duration_ms: clock.elapsed().as_millis() as u64,
                        outcome: AttemptOutcome::Succeeded {
                            size_bytes,
                            validation,
                        },
                    });
                    return Ok(AuthoringOutcome {
                        attempts,
                        strategy: strategy.name,
                        size_bytes,
                        validation,
                    });
                }
                Err(reason) => reason,
            },
            Ok(Some(reason)) => reason,
            Err(e) if is_cancellation(&e) => return Err(e),
            Err(e) => format!("{e:#}"),
        };

        // A strategy must not leave partial output behind for a later
        // strategy, or validation, to trip over.
        if req.output.exists() {
            let _ = fs::remove_file(&req.output);
        }

        debug!("strategy '{}' failed: {}", strategy.name, failure);
        progress.event(&StageEvent::StrategyFailed {
            strategy: strategy.name,
            reason: failure.clone(),
        });
        reasons.push(format!("{}: {}", strategy.name, failure));
        attempts.push(AuthoringAttempt {
            strategy: strategy.name,
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            outcome: AttemptOutcome::Failed { reason: failure },
        });
    }

    Err(PatchError::IsoAuthoringExhausted { reasons }.into())
}

/// Run one strategy. `Ok(None)` means the strategy itself reported success;
/// `Ok(Some(reason))` is a soft failure. `Err` is fatal (cancellation).
fn run_strategy(
    runner: &dyn ToolRunner,
    strategy: &Strategy,
    req: &AuthoringRequest,
    boot_present: bool,
    cancel: &CancelFlag,
    policy: &PatchPolicy,
) -> Result<Option<String>> {
    match &strategy.kind {
        StrategyKind::External { tool, build_args } => {
            let inv = Invocation::new(*tool, build_args(req));
            let result = runner.run(&inv, cancel, policy.tool_timeout())?;
            if result.success {
                Ok(None)
            } else {
                Ok(Some(result.failure_reason()))
            }
        }
        StrategyKind::Builtin => {
            let options = writer::WriterOptions {
                volume_label: &req.volume_label,
                application_id: &req.application_id,
                publisher: &req.publisher,
                boot_image: boot_present.then_some(BIOS_BOOT_IMAGE),
            };
            match writer::write_iso(&req.source_dir, &req.output, &options, cancel) {
                Ok(_) => Ok(None),
                Err(e) if is_cancellation(&e) => Err(e),
                Err(e) => Ok(Some(format!("{e:#}"))),
            }
        }
    }
}

/// Check that a strategy which claimed success actually left a plausible
/// image behind. Returns the validation result, or the failure reason.
fn check_output(req: &AuthoringRequest, min_bytes: u64) -> Result<Result<ValidationResult, String>> {
    let size = match fs::metadata(&req.output) {
        Ok(meta) if meta.len() > 0 => meta.len(),
        _ => return Ok(Err("tool exited successfully but produced no output".to_string())),
    };

    let validation = validate::validate_image(&req.output, min_bytes, &req.volume_label)?;
    if validation.overall_pass {
        Ok(Ok(validation))
    } else {
        Ok(Err(format!(
            "produced image failed validation (size {} bytes, size_ok={}, structure_ok={})",
            size, validation.size_ok, validation.structure_ok
        )))
    }
}
