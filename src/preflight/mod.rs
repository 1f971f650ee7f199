//! Preflight checks for host tool availability.
//!
//! Validates that the host has the external tools the pipeline delegates to
//! before any extraction starts. This prevents cryptic mid-pipeline errors
//! after minutes of ISO extraction.
//!
//! Three groups of tools:
//! - WIM and hive editing: every tool required.
//! - ISO extraction: at least one of the listed tools required.
//! - ISO authoring: optional, because the built-in writer is always
//!   available as the last authoring strategy; a warning is logged when no
//!   external author is installed.

use crate::error::PatchError;
use crate::process::ToolRunner;
use anyhow::Result;
use tracing::warn;

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools that must all be present. Each tuple is (command, Homebrew formula).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("wimlib-imagex", "wimlib"),
    ("hivexsh", "hivex"),
];

/// ISO extraction tools; any one of these is sufficient.
pub const EXTRACTION_TOOLS: &[(&str, &str)] = &[
    ("xorriso", "xorriso"),
    ("bsdtar", "libarchive"),
];

/// External ISO authoring tools, in the order the pipeline tries them.
pub const AUTHORING_TOOLS: &[(&str, &str)] = &[
    ("mkisofs", "cdrtools"),
    ("genisoimage", "dvdrtools"),
];

fn format_missing(missing: &[(&str, &str)]) -> Vec<String> {
    missing
        .iter()
        .map(|(tool, formula)| format!("  {} (install: brew install {})", tool, formula))
        .collect()
}

/// Check that specific tools are all available.
pub fn check_required_tools(runner: &dyn ToolRunner, tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<(&str, &str)> = tools
        .iter()
        .copied()
        .filter(|(tool, _)| !runner.is_available(tool))
        .collect();

    if !missing.is_empty() {
        return Err(PatchError::MissingTools(format_missing(&missing)).into());
    }
    Ok(())
}

/// Check that at least one tool from the group is available.
pub fn any_tool_available(runner: &dyn ToolRunner, tools: &[(&str, &str)]) -> bool {
    tools.iter().any(|(tool, _)| runner.is_available(tool))
}

/// Fail-fast host check run before the pipeline begins. Availability is
/// asked of the runner, not the host directly, so the whole pipeline can be
/// driven by a substitute runner.
pub fn check_host_tools(runner: &dyn ToolRunner) -> Result<()> {
    check_required_tools(runner, REQUIRED_TOOLS)?;

    if !any_tool_available(runner, EXTRACTION_TOOLS) {
        return Err(PatchError::MissingTools(format_missing(EXTRACTION_TOOLS)).into());
    }

    if !any_tool_available(runner, AUTHORING_TOOLS) {
        warn!("no external ISO authoring tool found; only the built-in writer will be tried");
    }

    Ok(())
}
