//! Offline registry patching.
//!
//! The patch planner is a pure function from source metadata to an ordered
//! list of hive writes: five hardware-check bypass DWORDs under
//! `SYSTEM\Setup\LabConfig`, then the spoofed Windows 10 version strings
//! under `SOFTWARE\Microsoft\Windows NT\CurrentVersion`.
//!
//! Applying a plan delegates to `hivexsh`. Its `setval` command replaces the
//! complete value list of a node, so the adapter first reads the existing
//! values with `lsval`, merges the plan's writes last-write-wins, and writes
//! the merged set back in one scripted session.

use crate::metadata::{SourceMetadata, VERSION_VALUE_NAMES};
use crate::policy::PatchPolicy;
use crate::process::{CancelFlag, Invocation, ToolRunner};
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

/// Hives touched by the patch, addressed by their path inside a WIM image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiveKind {
    System,
    Software,
}

impl HiveKind {
    /// Path of the hive file inside an extracted Windows image.
    pub fn image_path(&self) -> &'static str {
        match self {
            HiveKind::System => "Windows/System32/config/SYSTEM",
            HiveKind::Software => "Windows/System32/config/SOFTWARE",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            HiveKind::System => "SYSTEM",
            HiveKind::Software => "SOFTWARE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryValue {
    Dword(u32),
    Sz(String),
}

impl RegistryValue {
    /// Value literal in the syntax `hivexsh setval` accepts.
    pub fn hivexsh_literal(&self) -> String {
        match self {
            RegistryValue::Dword(v) => format!("dword:0x{:08x}", v),
            RegistryValue::Sz(s) => format!("string:{}", s),
        }
    }
}

/// One (hive, key, name, value) write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryWrite {
    pub hive: HiveKind,
    pub key_path: &'static str,
    pub name: String,
    pub value: RegistryValue,
}

/// Ordered set of writes, applied exactly once per target hive per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchPlan {
    pub writes: Vec<RegistryWrite>,
}

impl PatchPlan {
    pub fn writes_for(&self, hive: HiveKind) -> Vec<&RegistryWrite> {
        self.writes.iter().filter(|w| w.hive == hive).collect()
    }
}

/// Setup-time hardware check bypass flags, all DWORD = 1.
pub const BYPASS_VALUE_NAMES: &[&str] = &[
    "BypassTPMCheck",
    "BypassSecureBootCheck",
    "BypassRAMCheck",
    "BypassStorageCheck",
    "BypassCPUCheck",
];

pub const LABCONFIG_KEY: &str = r"\Setup\LabConfig";
pub const CURRENT_VERSION_KEY: &str = r"\Microsoft\Windows NT\CurrentVersion";

/// Compute the patch plan for a run. Pure and total: identical metadata
/// always yields an identical plan.
pub fn plan_patch(meta: &SourceMetadata) -> PatchPlan {
    let mut writes = Vec::new();

    for name in BYPASS_VALUE_NAMES {
        writes.push(RegistryWrite {
            hive: HiveKind::System,
            key_path: LABCONFIG_KEY,
            name: (*name).to_string(),
            value: RegistryValue::Dword(1),
        });
    }

    for name in VERSION_VALUE_NAMES {
        if let Some(value) = meta.registry_values.get(*name) {
            writes.push(RegistryWrite {
                hive: HiveKind::Software,
                key_path: CURRENT_VERSION_KEY,
                name: (*name).to_string(),
                value: RegistryValue::Sz(value.clone()),
            });
        }
    }

    PatchPlan { writes }
}

/// Apply a hive's share of the plan to an on-disk hive file.
///
/// Writes are grouped per key; for every key the existing values are read,
/// merged with the plan's writes (last write wins on duplicate names), and
/// the merged set committed in one `hivexsh -w` session.
pub fn apply_writes(
    runner: &dyn ToolRunner,
    hive_file: &Path,
    writes: &[&RegistryWrite],
    scratch: &Path,
    cancel: &CancelFlag,
    policy: &PatchPolicy,
) -> Result<()> {
    for key in key_order(writes) {
        let key_writes: Vec<&RegistryWrite> =
            writes.iter().copied().filter(|w| w.key_path == key).collect();

        let existing = read_key_values(runner, hive_file, key, scratch, cancel, policy)?;
        let key_exists = existing.is_some();
        let mut values = existing.unwrap_or_default();
        for write in &key_writes {
            upsert(&mut values, &write.name, write.value.hivexsh_literal());
        }

        let script = if key_exists {
            render_update_script(key, &values)
        } else {
            let (prefix, missing) = split_existing_prefix(runner, hive_file, key, scratch, cancel, policy)?;
            render_create_script(&prefix, &missing, &values)
        };

        let script_path = scratch.join("hivexsh-write.txt");
        fs::write(&script_path, script)
            .with_context(|| format!("writing hivexsh script '{}'", script_path.display()))?;

        let inv = Invocation::new("hivexsh", ["-w", "-f"])
            .arg_path(&script_path)
            .arg_path(hive_file);
        let result = runner.run(&inv, cancel, policy.tool_timeout())?;
        if !result.success {
            bail!(
                "hivexsh failed writing {} in '{}': {}",
                key,
                hive_file.display(),
                result.failure_reason()
            );
        }
    }
    Ok(())
}

/// Read all values of a key; `None` when the key does not exist.
pub fn read_key_values(
    runner: &dyn ToolRunner,
    hive_file: &Path,
    key: &str,
    scratch: &Path,
    cancel: &CancelFlag,
    policy: &PatchPolicy,
) -> Result<Option<Vec<(String, String)>>> {
    let script_path = scratch.join("hivexsh-read.txt");
    fs::write(&script_path, format!("cd {}\nlsval\nquit\n", key))
        .with_context(|| format!("writing hivexsh script '{}'", script_path.display()))?;

    let inv = Invocation::new("hivexsh", ["-f"])
        .arg_path(&script_path)
        .arg_path(hive_file);
    let result = runner.run(&inv, cancel, policy.tool_timeout())?;
    if !result.success {
        // hivexsh aborts the script on `cd` into a missing node.
        return Ok(None);
    }

    let mut values = Vec::new();
    for line in result.stdout.lines() {
        if let Some(pair) = parse_reg_line(line) {
            values.push(pair);
        }
    }
    Ok(Some(values))
}

/// Registry value names compare case-insensitively.
fn upsert(values: &mut Vec<(String, String)>, name: &str, literal: String) {
    if let Some(slot) = values
        .iter_mut()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
    {
        *slot = (name.to_string(), literal);
    } else {
        values.push((name.to_string(), literal));
    }
}

fn key_order<'a>(writes: &[&'a RegistryWrite]) -> Vec<&'static str> {
    let mut keys = Vec::new();
    for write in writes {
        if !keys.contains(&write.key_path) {
            keys.push(write.key_path);
        }
    }
    keys
}

/// Longest existing prefix of `key` plus the components left to create.
fn split_existing_prefix(
    runner: &dyn ToolRunner,
    hive_file: &Path,
    key: &str,
    scratch: &Path,
    cancel: &CancelFlag,
    policy: &PatchPolicy,
) -> Result<(String, Vec<String>)> {
    let components: Vec<&str> = key.split('\\').filter(|c| !c.is_empty()).collect();
    let mut existing = String::from("\\");
    let mut missing = Vec::new();

    for (i, component) in components.iter().enumerate() {
        if !missing.is_empty() {
            missing.push((*component).to_string());
            continue;
        }
        let candidate = format!(
            "\\{}",
            components[..=i].join("\\")
        );
        if key_exists(runner, hive_file, &candidate, scratch, cancel, policy)? {
            existing = candidate;
        } else {
            missing.push((*component).to_string());
        }
    }
    Ok((existing, missing))
}

fn key_exists(
    runner: &dyn ToolRunner,
    hive_file: &Path,
    key: &str,
    scratch: &Path,
    cancel: &CancelFlag,
    policy: &PatchPolicy,
) -> Result<bool> {
    let script_path = scratch.join("hivexsh-probe.txt");
    fs::write(&script_path, format!("cd {}\nquit\n", key))?;
    let inv = Invocation::new("hivexsh", ["-f"])
        .arg_path(&script_path)
        .arg_path(hive_file);
    let result = runner.run(&inv, cancel, policy.tool_timeout())?;
    Ok(result.success)
}

/// Script that rewrites the value list of an existing key.
fn render_update_script(key: &str, values: &[(String, String)]) -> String {
    let mut script = format!("cd {}\n", key);
    push_setval(&mut script, values);
    script
}

/// Script that creates the missing tail of a key, then writes its values.
fn render_create_script(existing_prefix: &str, missing: &[String], values: &[(String, String)]) -> String {
    let mut script = format!("cd {}\n", existing_prefix);
    for component in missing {
        script.push_str(&format!("add {}\ncd {}\n", component, component));
    }
    push_setval(&mut script, values);
    script
}

fn push_setval(script: &mut String, values: &[(String, String)]) {
    script.push_str(&format!("setval {}\n", values.len()));
    for (name, literal) in values {
        script.push_str(name);
        script.push('\n');
        script.push_str(literal);
        script.push('\n');
    }
    script.push_str("commit\nquit\n");
}

/// Parse one line of `lsval` output (regedit export syntax) into a value
/// name and a `setval` literal.
pub fn parse_reg_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if !line.starts_with('"') && !line.starts_with('@') {
        return None;
    }

    let (name, rest) = if let Some(stripped) = line.strip_prefix('@') {
        ("@".to_string(), stripped)
    } else {
        let end = find_closing_quote(&line[1..])? + 1;
        (unescape(&line[1..end]), &line[end + 1..])
    };

    let rest = rest.strip_prefix('=')?;
    let literal = if let Some(quoted) = rest.strip_prefix('"') {
        let end = find_closing_quote(quoted)?;
        format!("string:{}", unescape(&quoted[..end]))
    } else if let Some(hex) = rest.strip_prefix("dword:") {
        let parsed = u32::from_str_radix(hex.trim(), 16).ok()?;
        format!("dword:0x{:08x}", parsed)
    } else if let Some(body) = rest.strip_prefix("hex(") {
        let close = body.find(')')?;
        let vtype = &body[..close];
        let bytes = body[close + 1..].strip_prefix(':')?;
        format!("hex:{}:{}", vtype, bytes.trim())
    } else if let Some(bytes) = rest.strip_prefix("hex:") {
        format!("hex:3:{}", bytes.trim())
    } else {
        return None;
    };

    Some((name, literal))
}

fn find_closing_quote(s: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            '"' if !escaped => return Some(i),
            _ => escaped = false,
        }
    }
    None
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::tests::sample_metadata;

    #[test]
    fn plan_is_deterministic() {
        let meta = sample_metadata();
        let a = plan_patch(&meta);
        let b = plan_patch(&meta);
        assert_eq!(a, b);
    }

    #[test]
    fn plan_always_carries_five_bypass_flags() {
        let plan = plan_patch(&sample_metadata());
        let system = plan.writes_for(HiveKind::System);
        assert_eq!(system.len(), 5);
        for (write, expected) in system.iter().zip(BYPASS_VALUE_NAMES) {
            assert_eq!(write.name, *expected);
            assert_eq!(write.value, RegistryValue::Dword(1));
            assert_eq!(write.key_path, LABCONFIG_KEY);
        }
    }

    #[test]
    fn plan_spoofs_version_strings_from_metadata() {
        let plan = plan_patch(&sample_metadata());
        let software = plan.writes_for(HiveKind::Software);
        assert_eq!(software.len(), VERSION_VALUE_NAMES.len());
        let product = software
            .iter()
            .find(|w| w.name == "ProductName")
            .unwrap();
        assert_eq!(
            product.value,
            RegistryValue::Sz("Windows 10 Pro".to_string())
        );
    }

    #[test]
    fn parses_lsval_output() {
        assert_eq!(
            parse_reg_line(r#""ProductName"="Windows 10 Pro""#),
            Some(("ProductName".to_string(), "string:Windows 10 Pro".to_string()))
        );
        assert_eq!(
            parse_reg_line(r#""BypassTPMCheck"=dword:00000001"#),
            Some(("BypassTPMCheck".to_string(), "dword:0x00000001".to_string()))
        );
        assert_eq!(
            parse_reg_line(r#""Blob"=hex(3):aa,bb,cc"#),
            Some(("Blob".to_string(), "hex:3:aa,bb,cc".to_string()))
        );
        assert_eq!(parse_reg_line("Subkey"), None);
        assert_eq!(parse_reg_line(""), None);
    }

    #[test]
    fn merge_is_last_write_wins() {
        let mut values = vec![
            ("ProductName".to_string(), "string:Windows 11 Pro".to_string()),
            ("SystemRoot".to_string(), "string:C:\\Windows".to_string()),
        ];
        upsert(&mut values, "ProductName", "string:Windows 10 Pro".to_string());
        upsert(&mut values, "EditionID", "string:Professional".to_string());

        assert_eq!(values.len(), 3);
        assert_eq!(values[0].1, "string:Windows 10 Pro");
        assert_eq!(values[1].0, "SystemRoot");
        assert_eq!(values[2].0, "EditionID");
    }

    #[test]
    fn create_script_adds_missing_components() {
        let values = vec![("BypassTPMCheck".to_string(), "dword:0x00000001".to_string())];
        let script = render_create_script("\\Setup", &["LabConfig".to_string()], &values);
        assert_eq!(
            script,
            "cd \\Setup\nadd LabConfig\ncd LabConfig\nsetval 1\nBypassTPMCheck\ndword:0x00000001\ncommit\nquit\n"
        );
    }

    #[test]
    fn update_script_rewrites_value_list() {
        let values = vec![
            ("A".to_string(), "string:x".to_string()),
            ("B".to_string(), "dword:0x00000002".to_string()),
        ];
        let script = render_update_script(CURRENT_VERSION_KEY, &values);
        assert!(script.starts_with("cd \\Microsoft\\Windows NT\\CurrentVersion\nsetval 2\n"));
        assert!(script.ends_with("commit\nquit\n"));
    }
}
