//! WIM container operations and the image rebuild step.
//!
//! All container work is delegated to `wimlib-imagex`. Rebuilds follow an
//! atomic-replace discipline: the new container is always captured or edited
//! under a temporary name and renamed over the original only after the tool
//! reports success, so a failed repack never corrupts the pre-existing file.

use crate::error::{is_cancellation, PatchError};
use crate::metadata::SourceMetadata;
use crate::policy::PatchPolicy;
use crate::process::{CancelFlag, Invocation, ToolRunner};
use crate::registry::{self, HiveKind, PatchPlan};
use crate::workspace::BuildWorkspace;
use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One image inside a WIM container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WimImageInfo {
    pub index: u32,
    pub name: String,
    pub description: String,
}

/// List the images inside a WIM via `wimlib-imagex info`.
pub fn wim_info(
    runner: &dyn ToolRunner,
    wim: &Path,
    cancel: &CancelFlag,
    policy: &PatchPolicy,
) -> Result<Vec<WimImageInfo>> {
    let inv = Invocation::new("wimlib-imagex", ["info"]).arg_path(wim);
    let result = runner.run(&inv, cancel, policy.tool_timeout())?;
    if !result.success {
        bail!(
            "wimlib-imagex info failed for '{}': {}",
            wim.display(),
            result.failure_reason()
        );
    }
    Ok(parse_info_output(&result.stdout))
}

fn parse_info_output(stdout: &str) -> Vec<WimImageInfo> {
    let mut images = Vec::new();
    let mut current: Option<WimImageInfo> = None;

    for line in stdout.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "Index" => {
                if let Some(image) = current.take() {
                    images.push(image);
                }
                if let Ok(index) = value.parse() {
                    current = Some(WimImageInfo {
                        index,
                        name: String::new(),
                        description: String::new(),
                    });
                }
            }
            "Name" => {
                if let Some(image) = current.as_mut() {
                    image.name = value.to_string();
                }
            }
            "Description" => {
                if let Some(image) = current.as_mut() {
                    image.description = value.to_string();
                }
            }
            _ => {}
        }
    }
    if let Some(image) = current.take() {
        images.push(image);
    }
    images
}

/// Extract one image of a WIM into `dest`.
pub fn extract_image(
    runner: &dyn ToolRunner,
    wim: &Path,
    index: u32,
    dest: &Path,
    cancel: &CancelFlag,
    policy: &PatchPolicy,
) -> Result<()> {
    fs::create_dir_all(dest)?;
    let inv = Invocation::new("wimlib-imagex", ["extract"])
        .arg_path(wim)
        .arg(index.to_string())
        .arg(format!("--dest-dir={}", dest.display()))
        .arg("--no-acls");
    let result = runner.run(&inv, cancel, policy.tool_timeout())?;
    if !result.success {
        bail!(
            "wimlib-imagex extract failed for '{}': {}",
            wim.display(),
            result.failure_reason()
        );
    }
    Ok(())
}

/// Extract a single file out of a WIM image; returns its path under
/// `dest_dir`.
pub fn extract_single_path(
    runner: &dyn ToolRunner,
    wim: &Path,
    index: u32,
    inner: &str,
    dest_dir: &Path,
    cancel: &CancelFlag,
    policy: &PatchPolicy,
) -> Result<PathBuf> {
    fs::create_dir_all(dest_dir)?;
    let inv = Invocation::new("wimlib-imagex", ["extract"])
        .arg_path(wim)
        .arg(index.to_string())
        .arg(inner)
        .arg(format!("--dest-dir={}", dest_dir.display()))
        .arg("--no-acls");
    let result = runner.run(&inv, cancel, policy.tool_timeout())?;
    if !result.success {
        bail!(
            "wimlib-imagex extract of '{}' failed: {}",
            inner,
            result.failure_reason()
        );
    }

    let name = inner.rsplit('/').next().unwrap_or(inner);
    let out = dest_dir.join(name);
    if !out.is_file() {
        bail!("wimlib-imagex reported success but '{}' is missing", out.display());
    }
    Ok(out)
}

/// Capture a directory tree back into a bootable WIM.
pub fn capture_image(
    runner: &dyn ToolRunner,
    tree: &Path,
    wim_out: &Path,
    image_name: &str,
    cancel: &CancelFlag,
    policy: &PatchPolicy,
) -> Result<()> {
    let inv = Invocation::new("wimlib-imagex", ["capture"])
        .arg_path(tree)
        .arg_path(wim_out)
        .arg(image_name)
        .arg("--compress=LZX")
        .arg("--check")
        .arg("--boot");
    let result = runner.run(&inv, cancel, policy.tool_timeout())?;
    if !result.success {
        bail!("wimlib-imagex capture failed: {}", result.failure_reason());
    }
    Ok(())
}

/// Set the display name and description of one image in place.
pub fn set_image_metadata(
    runner: &dyn ToolRunner,
    wim: &Path,
    index: u32,
    name: &str,
    description: &str,
    cancel: &CancelFlag,
    policy: &PatchPolicy,
) -> Result<()> {
    let inv = Invocation::new("wimlib-imagex", ["info"])
        .arg_path(wim)
        .arg(index.to_string())
        .arg(name)
        .arg(description);
    let result = runner.run(&inv, cancel, policy.tool_timeout())?;
    if !result.success {
        bail!(
            "wimlib-imagex info (rename image {}) failed: {}",
            index,
            result.failure_reason()
        );
    }
    Ok(())
}

fn container_error(container: &Path, err: anyhow::Error) -> anyhow::Error {
    let name = container
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| container.display().to_string());
    anyhow!(PatchError::ContainerRebuild {
        container: name,
        reason: format!("{err:#}"),
    })
}

/// Rebuild the boot container: extract the first image, apply the registry
/// patch plan to its hives, recapture, and atomically replace the original.
pub fn rebuild_boot_wim(
    runner: &dyn ToolRunner,
    ws: &BuildWorkspace,
    boot_wim: &Path,
    plan: &PatchPlan,
    cancel: &CancelFlag,
    policy: &PatchPolicy,
) -> Result<()> {
    rebuild_boot_wim_inner(runner, ws, boot_wim, plan, cancel, policy).map_err(|e| {
        if is_cancellation(&e) {
            e
        } else {
            container_error(boot_wim, e)
        }
    })
}

fn rebuild_boot_wim_inner(
    runner: &dyn ToolRunner,
    ws: &BuildWorkspace,
    boot_wim: &Path,
    plan: &PatchPlan,
    cancel: &CancelFlag,
    policy: &PatchPolicy,
) -> Result<()> {
    let images = wim_info(runner, boot_wim, cancel, policy)?;
    // WinPE is image 1; Setup may follow as image 2.
    let image = images
        .first()
        .cloned()
        .unwrap_or_else(|| WimImageInfo {
            index: 1,
            name: "Microsoft Windows PE".to_string(),
            description: String::new(),
        });
    debug!(index = image.index, name = %image.name, "patching boot image");

    let tree = ws.subdir("boot-wim/tree")?;
    let scratch = ws.subdir("boot-wim/scratch")?;
    extract_image(runner, boot_wim, image.index, &tree, cancel, policy)?;

    cancel.check()?;

    for hive in [HiveKind::System, HiveKind::Software] {
        let writes = plan.writes_for(hive);
        if writes.is_empty() {
            continue;
        }
        let hive_file = tree.join(hive.image_path());
        if !hive_file.is_file() {
            bail!(
                "{} hive missing from extracted boot image at '{}'",
                hive.file_name(),
                hive_file.display()
            );
        }
        registry::apply_writes(runner, &hive_file, &writes, &scratch, cancel, policy)?;
    }

    cancel.check()?;

    // Capture under a temp name; rename over the original only on success.
    let staged = staged_path(boot_wim);
    let capture = capture_image(runner, &tree, &staged, &image.name, cancel, policy);
    if let Err(e) = capture {
        let _ = fs::remove_file(&staged);
        return Err(e);
    }
    if !is_non_empty_file(&staged) {
        let _ = fs::remove_file(&staged);
        bail!("capture reported success but produced no file");
    }
    fs::rename(&staged, boot_wim)
        .with_context(|| format!("replacing '{}'", boot_wim.display()))?;
    Ok(())
}

/// Rebuild the install container: spoof every image's display name and
/// description, leaving the payload untouched. Returns the image count.
pub fn rebuild_install_wim(
    runner: &dyn ToolRunner,
    install_wim: &Path,
    meta: &SourceMetadata,
    cancel: &CancelFlag,
    policy: &PatchPolicy,
) -> Result<u32> {
    rebuild_install_wim_inner(runner, install_wim, meta, cancel, policy).map_err(|e| {
        if is_cancellation(&e) {
            e
        } else {
            container_error(install_wim, e)
        }
    })
}

fn rebuild_install_wim_inner(
    runner: &dyn ToolRunner,
    install_wim: &Path,
    meta: &SourceMetadata,
    cancel: &CancelFlag,
    policy: &PatchPolicy,
) -> Result<u32> {
    let images = wim_info(runner, install_wim, cancel, policy)?;
    if images.is_empty() {
        bail!("'{}' contains no images", install_wim.display());
    }

    // Edit a copy so a mid-edit failure leaves the original bytes intact.
    let staged = staged_path(install_wim);
    fs::copy(install_wim, &staged)
        .with_context(|| format!("staging copy of '{}'", install_wim.display()))?;

    let description = format!("{} (build {})", meta.product_name, meta.build_number);
    for image in &images {
        cancel.check().inspect_err(|_| {
            let _ = fs::remove_file(&staged);
        })?;
        if let Err(e) = set_image_metadata(
            runner,
            &staged,
            image.index,
            &meta.product_name,
            &description,
            cancel,
            policy,
        ) {
            let _ = fs::remove_file(&staged);
            return Err(e);
        }
    }

    fs::rename(&staged, install_wim)
        .with_context(|| format!("replacing '{}'", install_wim.display()))?;
    Ok(images.len() as u32)
}

/// Sibling temp name used for atomic replacement.
fn staged_path(original: &Path) -> PathBuf {
    let mut name = original
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "container".to_string());
    name.push_str(".patched");
    original.with_file_name(name)
}

fn is_non_empty_file(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::tests::sample_metadata;
    use crate::process::ExitResult;
    use crate::testing::ScriptedRunner;
    use tempfile::TempDir;

    const INFO_TWO_IMAGES: &str = "\
WIM Information:
----------------
Path:           install.wim
GUID:           0xdeadbeef

Available Images:
-----------------
Index:                  1
Name:                   Windows 11 Pro
Description:            Windows 11 Pro

Index:                  2
Name:                   Windows 11 Home
Description:            Windows 11 Home
";

    #[test]
    fn parses_image_list() {
        let images = parse_info_output(INFO_TWO_IMAGES);
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].index, 1);
        assert_eq!(images[0].name, "Windows 11 Pro");
        assert_eq!(images[1].index, 2);
        assert_eq!(images[1].name, "Windows 11 Home");
    }

    #[test]
    fn install_rebuild_spoofs_every_image() {
        let temp = TempDir::new().unwrap();
        let wim = temp.path().join("install.wim");
        fs::write(&wim, b"original install wim").unwrap();

        let runner = ScriptedRunner::new()
            .expect(|_| Ok(ExitResult::ok(INFO_TWO_IMAGES)))
            .expect_ok()
            .expect_ok();

        let count = rebuild_install_wim(
            &runner,
            &wim,
            &sample_metadata(),
            &CancelFlag::new(),
            &PatchPolicy::default(),
        )
        .unwrap();

        assert_eq!(count, 2);
        assert_eq!(runner.remaining(), 0);
        let calls = runner.calls();
        assert!(calls[1].contains("Windows 10 Pro"));
        assert!(calls[2].contains("Windows 10 Pro"));
        // Staged copy was renamed over the original.
        assert!(wim.is_file());
        assert!(!staged_path(&wim).exists());
    }

    #[test]
    fn install_rebuild_failure_preserves_original() {
        let temp = TempDir::new().unwrap();
        let wim = temp.path().join("install.wim");
        fs::write(&wim, b"original install wim").unwrap();

        let runner = ScriptedRunner::new()
            .expect(|_| Ok(ExitResult::ok(INFO_TWO_IMAGES)))
            .expect(|_| Ok(ExitResult::failed("disk full")));

        let err = rebuild_install_wim(
            &runner,
            &wim,
            &sample_metadata(),
            &CancelFlag::new(),
            &PatchPolicy::default(),
        )
        .unwrap_err();

        let patch_err = err.downcast_ref::<PatchError>().unwrap();
        assert!(matches!(patch_err, PatchError::ContainerRebuild { .. }));
        assert!(err.to_string().contains("install.wim"));
        assert_eq!(fs::read(&wim).unwrap(), b"original install wim");
        assert!(!staged_path(&wim).exists());
    }

    #[test]
    fn boot_rebuild_failed_capture_preserves_original() {
        let temp = TempDir::new().unwrap();
        let wim = temp.path().join("boot.wim");
        fs::write(&wim, b"original boot wim").unwrap();
        let ws = BuildWorkspace::create().unwrap();
        let empty_plan = PatchPlan { writes: Vec::new() };

        let runner = ScriptedRunner::new()
            // info
            .expect(|_| Ok(ExitResult::ok("Index:                  1\nName:                   Microsoft Windows PE (x64)\n")))
            // extract
            .expect_ok()
            // capture fails
            .expect(|_| Ok(ExitResult::failed("cannot write archive")));

        let err = rebuild_boot_wim(
            &runner,
            &ws,
            &wim,
            &empty_plan,
            &CancelFlag::new(),
            &PatchPolicy::default(),
        )
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<PatchError>(),
            Some(PatchError::ContainerRebuild { .. })
        ));
        assert_eq!(fs::read(&wim).unwrap(), b"original boot wim");
        assert!(!staged_path(&wim).exists());
    }

    #[test]
    fn staged_path_is_a_sibling() {
        let staged = staged_path(Path::new("/x/sources/boot.wim"));
        assert_eq!(staged, Path::new("/x/sources/boot.wim.patched"));
    }
}
