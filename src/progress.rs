//! Stage-completion events.
//!
//! The pipeline reports progress as a sequence of discrete events so a CLI
//! log and a GUI progress indicator can both consume them. The reporting
//! channel is a collaborator, not part of the pipeline contract.

use crate::iso::validate::ValidationResult;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub enum StageEvent {
    PreflightPassed,
    MetadataExtracted {
        product_name: String,
        build_number: String,
        volume_label: String,
    },
    TargetExtracted {
        file_count: u64,
    },
    BootImagePatched,
    InstallImagePatched {
        images: u32,
    },
    StrategyStarted {
        strategy: &'static str,
        index: usize,
        total: usize,
    },
    StrategyFailed {
        strategy: &'static str,
        reason: String,
    },
    IsoAuthored {
        strategy: &'static str,
        size_bytes: u64,
    },
    Validated {
        result: ValidationResult,
    },
    OutputReady {
        path: PathBuf,
    },
}

pub trait Progress {
    fn event(&self, event: &StageEvent);
}

/// Logs every stage event through `tracing`.
#[derive(Debug, Default)]
pub struct LogProgress;

impl Progress for LogProgress {
    fn event(&self, event: &StageEvent) {
        match event {
            StageEvent::PreflightPassed => info!("host tools present"),
            StageEvent::MetadataExtracted {
                product_name,
                build_number,
                volume_label,
            } => info!(
                product_name,
                build_number, volume_label, "reference metadata extracted"
            ),
            StageEvent::TargetExtracted { file_count } => {
                info!(file_count, "target ISO extracted")
            }
            StageEvent::BootImagePatched => info!("boot.wim patched (bypass + version spoof)"),
            StageEvent::InstallImagePatched { images } => {
                info!(images, "install image names spoofed")
            }
            StageEvent::StrategyStarted {
                strategy,
                index,
                total,
            } => info!("authoring strategy {}/{}: {}", index, total, strategy),
            StageEvent::StrategyFailed { strategy, reason } => {
                warn!("strategy '{}' failed: {}", strategy, reason)
            }
            StageEvent::IsoAuthored {
                strategy,
                size_bytes,
            } => info!(size_bytes, "image authored by '{}'", strategy),
            StageEvent::Validated { result } => {
                if !result.volume_label_ok {
                    warn!("volume label differs from reference (tool may normalize labels)");
                }
                info!(
                    size_ok = result.size_ok,
                    structure_ok = result.structure_ok,
                    volume_label_ok = result.volume_label_ok,
                    "validation finished"
                )
            }
            StageEvent::OutputReady { path } => info!("output written to {}", path.display()),
        }
    }
}

/// Discards all events; used by tests.
#[derive(Debug, Default)]
pub struct NullProgress;

impl Progress for NullProgress {
    fn event(&self, _event: &StageEvent) {}
}
