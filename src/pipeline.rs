//! End-to-end patch pipeline.
//!
//! Orchestrates the whole run: preflight, metadata extraction from the
//! reference image, target extraction, registry patch planning and
//! application, container rebuilds, ISO authoring with fallback, and final
//! delivery of the output image plus its run report.
//!
//! Stage order matters: everything cheap and read-only runs before the
//! expensive extraction, and the output path is only touched after a fully
//! validated image exists inside the workspace.

use crate::error::PatchError;
use crate::extract;
use crate::iso::{self, AuthoringRequest};
use crate::metadata;
use crate::policy::PatchPolicy;
use crate::preflight;
use crate::process::{CancelFlag, ToolRunner};
use crate::progress::{Progress, StageEvent};
use crate::registry;
use crate::report::{self, RunReport};
use crate::wim;
use crate::workspace::BuildWorkspace;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Publisher string stamped into authored media.
const PUBLISHER: &str = "Microsoft Corporation";

/// Inputs for one pipeline run.
#[derive(Debug, Clone)]
pub struct PatchRequest {
    /// The Windows 11 ISO to patch.
    pub target_iso: PathBuf,
    /// The Windows 10 ISO whose identity is spoofed onto the target.
    pub reference_iso: PathBuf,
    /// Where the patched image is delivered.
    pub output_iso: PathBuf,
    pub policy: PatchPolicy,
}

/// Everything a caller might want to show after a successful run.
#[derive(Debug, Clone)]
pub struct PatchOutcome {
    pub output_iso: PathBuf,
    pub report_path: PathBuf,
    pub report: RunReport,
}

/// Run the full pipeline.
pub fn run(
    runner: &dyn ToolRunner,
    req: &PatchRequest,
    cancel: &CancelFlag,
    progress: &dyn Progress,
) -> Result<PatchOutcome> {
    let started_at = report::timestamp();

    check_inputs(req)?;
    preflight::check_host_tools(runner)?;
    progress.event(&StageEvent::PreflightPassed);

    let ws = BuildWorkspace::create()?;
    cancel.check()?;

    let meta = metadata::extract_source_metadata(
        runner,
        &ws,
        &req.reference_iso,
        cancel,
        &req.policy,
    )?;
    progress.event(&StageEvent::MetadataExtracted {
        product_name: meta.product_name.clone(),
        build_number: meta.build_number.clone(),
        volume_label: meta.volume_label.clone(),
    });

    cancel.check()?;
    let target_dir = ws.subdir("target")?;
    extract::extract_iso(runner, &req.target_iso, &target_dir, cancel, &req.policy)?;
    progress.event(&StageEvent::TargetExtracted {
        file_count: extract::count_files(&target_dir),
    });

    let boot_wim = extract::find_file(&target_dir, "boot.wim").ok_or_else(|| {
        PatchError::ContainerRebuild {
            container: "boot.wim".to_string(),
            reason: "not present in the extracted target ISO".to_string(),
        }
    })?;
    let install_wim = find_install_image(&target_dir).ok_or_else(|| {
        PatchError::ContainerRebuild {
            container: "install.wim".to_string(),
            reason: "neither install.wim nor install.esd present in the extracted target ISO"
                .to_string(),
        }
    })?;

    let plan = registry::plan_patch(&meta);
    info!(writes = plan.writes.len(), "registry patch plan computed");

    cancel.check()?;
    wim::rebuild_boot_wim(runner, &ws, &boot_wim, &plan, cancel, &req.policy)?;
    progress.event(&StageEvent::BootImagePatched);

    cancel.check()?;
    let images = wim::rebuild_install_wim(runner, &install_wim, &meta, cancel, &req.policy)?;
    progress.event(&StageEvent::InstallImagePatched { images });

    // Author into the workspace; the caller's output path is only written
    // once a validated image exists.
    let staged_output = ws.file("patched.iso");
    let authoring = iso::author_iso(
        runner,
        &AuthoringRequest {
            source_dir: target_dir,
            output: staged_output.clone(),
            volume_label: meta.volume_label.clone(),
            application_id: meta.product_name.clone(),
            publisher: PUBLISHER.to_string(),
        },
        cancel,
        &req.policy,
        progress,
    )?;

    cancel.check()?;
    deliver_output(&staged_output, &req.output_iso)?;
    verify_delivery(&req.output_iso, authoring.size_bytes, &meta.volume_label)?;

    let report = RunReport {
        started_at,
        finished_at: report::timestamp(),
        target_iso: req.target_iso.clone(),
        reference_iso: req.reference_iso.clone(),
        output_iso: req.output_iso.clone(),
        spoofed_product_name: meta.product_name.clone(),
        spoofed_build_number: meta.build_number.clone(),
        volume_label: meta.volume_label.clone(),
        install_images_spoofed: images,
        authoring_strategy: authoring.strategy.to_string(),
        authoring_attempts: authoring.attempts,
        validation: authoring.validation,
        output_size_bytes: authoring.size_bytes,
        output_sha256: report::sha256_file(&req.output_iso)?,
    };
    let report_path = report.write_beside(&req.output_iso)?;
    progress.event(&StageEvent::OutputReady {
        path: req.output_iso.clone(),
    });

    Ok(PatchOutcome {
        output_iso: req.output_iso.clone(),
        report_path,
        report,
    })
}

fn check_inputs(req: &PatchRequest) -> Result<()> {
    for (label, path) in [
        ("target ISO", &req.target_iso),
        ("reference ISO", &req.reference_iso),
    ] {
        if !path.is_file() {
            bail!("{} '{}' does not exist", label, path.display());
        }
    }
    if req.output_iso == req.target_iso || req.output_iso == req.reference_iso {
        bail!(
            "output path '{}' would overwrite an input",
            req.output_iso.display()
        );
    }
    Ok(())
}

/// Windows media ships either `install.wim` or the solid-compressed
/// `install.esd`; both are WIM containers to `wimlib-imagex`.
fn find_install_image(target_dir: &Path) -> Option<PathBuf> {
    extract::find_file(target_dir, "install.wim")
        .or_else(|| extract::find_file(target_dir, "install.esd"))
}

/// Move the finished image from the workspace to its destination.
///
/// A plain rename is atomic on the same filesystem; across filesystems the
/// image is copied to a `.partial` sibling first so an interrupted copy
/// never leaves a plausible-looking ISO at the destination.
fn deliver_output(staged: &Path, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating output directory '{}'", parent.display()))?;
        }
    }

    if fs::rename(staged, destination).is_ok() {
        return Ok(());
    }

    let partial = partial_path(destination);
    let copy = fs::copy(staged, &partial)
        .with_context(|| format!("copying image to '{}'", partial.display()));
    if let Err(e) = copy {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }
    fs::rename(&partial, destination)
        .with_context(|| format!("moving image into place at '{}'", destination.display()))?;
    let _ = fs::remove_file(staged);
    Ok(())
}

/// Re-check the image at its final location. The authored bytes were
/// already validated inside the workspace, so anything wrong here means the
/// move itself lost data.
fn verify_delivery(output: &Path, expected_bytes: u64, volume_label: &str) -> Result<()> {
    let result = iso::validate::validate_image(output, expected_bytes, volume_label)?;
    if !result.overall_pass {
        return Err(PatchError::Validation(format!(
            "delivered image '{}' does not match the authored one (size_ok={}, structure_ok={})",
            output.display(),
            result.size_ok,
            result.structure_ok
        ))
        .into());
    }
    Ok(())
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output.iso".to_string());
    name.push_str(".partial");
    destination.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iso::inspect::test_support::write_fake_iso;
    use crate::process::{ExitResult, Invocation};
    use crate::progress::NullProgress;
    use crate::testing::ScriptedRunner;
    use tempfile::TempDir;

    const LABEL: &str = "CCCOMA_X64FRE_EN-US_DV9";

    fn dest_dir_of(inv: &Invocation) -> PathBuf {
        inv.args
            .iter()
            .find_map(|a| a.strip_prefix("--dest-dir="))
            .map(PathBuf::from)
            .unwrap()
    }

    fn arg_after(inv: &Invocation, flag: &str) -> PathBuf {
        let i = inv.args.iter().position(|a| a == flag).unwrap();
        PathBuf::from(&inv.args[i + 1])
    }

    /// Script for every stage before authoring: reference metadata, target
    /// extraction, and both container rebuilds.
    fn script_through_rebuilds() -> ScriptedRunner {
        ScriptedRunner::new()
            // boot.wim out of the reference ISO
            .expect(|inv| {
                fs::write(PathBuf::from(inv.args.last().unwrap()), b"ref boot wim").unwrap();
                Ok(ExitResult::ok(""))
            })
            // SOFTWARE hive out of its first image
            .expect(|inv| {
                fs::write(dest_dir_of(inv).join("SOFTWARE"), b"hive").unwrap();
                Ok(ExitResult::ok(""))
            })
            // version values of the reference
            .expect(|_| {
                Ok(ExitResult::ok(concat!(
                    "\"ProductName\"=\"Windows 10 Pro\"\n",
                    "\"EditionID\"=\"Professional\"\n",
                    "\"CurrentBuild\"=\"19045\"\n",
                    "\"CurrentBuildNumber\"=\"19045\"\n",
                    "\"CurrentVersion\"=\"6.3\"\n",
                )))
            })
            // target ISO contents
            .expect(|inv| {
                let dest = PathBuf::from(inv.args.last().unwrap());
                fs::create_dir_all(dest.join("sources")).unwrap();
                fs::create_dir_all(dest.join("boot")).unwrap();
                fs::write(dest.join("sources/boot.wim"), b"target boot wim").unwrap();
                fs::write(dest.join("sources/install.wim"), b"target install wim").unwrap();
                fs::write(dest.join("boot/etfsboot.com"), b"etfs").unwrap();
                Ok(ExitResult::ok(""))
            })
            // boot.wim image list
            .expect(|_| {
                Ok(ExitResult::ok(
                    "Index:                  1\nName:                   Microsoft Windows PE (x64)\n",
                ))
            })
            // boot image extraction, hives included
            .expect(|inv| {
                let config = dest_dir_of(inv).join("Windows/System32/config");
                fs::create_dir_all(&config).unwrap();
                fs::write(config.join("SYSTEM"), b"system hive").unwrap();
                fs::write(config.join("SOFTWARE"), b"software hive").unwrap();
                Ok(ExitResult::ok(""))
            })
            // LabConfig: read existing values, then write the merged set
            .expect(|_| Ok(ExitResult::ok("")))
            .expect_ok()
            // CurrentVersion: same
            .expect(|_| Ok(ExitResult::ok("")))
            .expect_ok()
            // recapture of the patched boot image
            .expect(|inv| {
                fs::write(&inv.args[2], b"captured boot wim").unwrap();
                Ok(ExitResult::ok(""))
            })
            // install.wim image list, then its one image renamed
            .expect(|_| {
                Ok(ExitResult::ok(
                    "Index:                  1\nName:                   Windows 11 Pro\n",
                ))
            })
            .expect_ok()
    }

    fn scripted_request(temp: &TempDir) -> PatchRequest {
        let reference = temp.path().join("win10.iso");
        write_fake_iso(&reference, LABEL, 64 * 2048);
        let target = temp.path().join("win11.iso");
        fs::write(&target, vec![0u8; 4096]).unwrap();
        PatchRequest {
            target_iso: target,
            reference_iso: reference,
            output_iso: temp.path().join("out/patched.iso"),
            policy: PatchPolicy::default(),
        }
    }

    #[test]
    fn scripted_run_delivers_output_and_report() {
        let temp = TempDir::new().unwrap();
        let req = scripted_request(&temp);

        // Authoring succeeds on the first strategy.
        let runner = script_through_rebuilds().expect(|inv| {
            write_fake_iso(&arg_after(inv, "-o"), LABEL, 64 * 2048);
            Ok(ExitResult::ok(""))
        });

        let outcome = run(&runner, &req, &CancelFlag::new(), &NullProgress).unwrap();

        assert_eq!(outcome.output_iso, req.output_iso);
        assert!(req.output_iso.is_file());
        assert!(outcome.report_path.is_file());
        assert_eq!(outcome.report.spoofed_product_name, "Windows 10 Pro");
        assert_eq!(outcome.report.spoofed_build_number, "19045");
        assert_eq!(outcome.report.volume_label, LABEL);
        assert_eq!(outcome.report.install_images_spoofed, 1);
        assert!(outcome.report.validation.overall_pass);
        assert_eq!(runner.remaining(), 0);
    }

    #[test]
    fn cancellation_during_authoring_leaves_no_destination_file() {
        let temp = TempDir::new().unwrap();
        let req = scripted_request(&temp);
        let cancel = CancelFlag::new();

        let cancel_in_step = cancel.clone();
        let runner = script_through_rebuilds().expect(move |_| {
            cancel_in_step.cancel();
            Ok(ExitResult::failed("interrupted"))
        });

        let err = run(&runner, &req, &cancel, &NullProgress).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PatchError>(),
            Some(PatchError::Cancelled)
        ));
        assert!(!req.output_iso.exists());
        assert!(!partial_path(&req.output_iso).exists());
    }

    #[test]
    fn truncated_delivery_is_a_validation_error() {
        let temp = TempDir::new().unwrap();
        let delivered = temp.path().join("patched.iso");
        write_fake_iso(&delivered, LABEL, 64 * 2048);

        // The authored image was twice this size.
        let err = verify_delivery(&delivered, 128 * 2048, LABEL).unwrap_err();
        let patch_err = err.downcast_ref::<PatchError>().unwrap();
        assert!(matches!(patch_err, PatchError::Validation(_)));
        assert_eq!(patch_err.exit_code(), 5);
    }

    #[test]
    fn intact_delivery_verifies() {
        let temp = TempDir::new().unwrap();
        let delivered = temp.path().join("patched.iso");
        write_fake_iso(&delivered, LABEL, 64 * 2048);
        assert!(verify_delivery(&delivered, 64 * 2048, LABEL).is_ok());
    }

    #[test]
    fn rejects_missing_inputs() {
        let temp = TempDir::new().unwrap();
        let req = PatchRequest {
            target_iso: temp.path().join("no-such.iso"),
            reference_iso: temp.path().join("also-missing.iso"),
            output_iso: temp.path().join("out.iso"),
            policy: PatchPolicy::default(),
        };
        let err = check_inputs(&req).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn rejects_output_over_an_input() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("win11.iso");
        let reference = temp.path().join("win10.iso");
        fs::write(&target, b"a").unwrap();
        fs::write(&reference, b"b").unwrap();

        let req = PatchRequest {
            target_iso: target.clone(),
            reference_iso: reference,
            output_iso: target,
            policy: PatchPolicy::default(),
        };
        assert!(check_inputs(&req).is_err());
    }

    #[test]
    fn delivery_renames_and_creates_parent() {
        let temp = TempDir::new().unwrap();
        let staged = temp.path().join("patched.iso");
        fs::write(&staged, b"image bytes").unwrap();
        let dest = temp.path().join("deep/nested/out.iso");

        deliver_output(&staged, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"image bytes");
        assert!(!staged.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn install_image_lookup_prefers_wim_then_esd() {
        let temp = TempDir::new().unwrap();
        let sources = temp.path().join("sources");
        fs::create_dir_all(&sources).unwrap();
        assert!(find_install_image(temp.path()).is_none());

        fs::write(sources.join("install.esd"), b"esd").unwrap();
        assert!(find_install_image(temp.path())
            .unwrap()
            .ends_with("install.esd"));

        fs::write(sources.join("install.wim"), b"wim").unwrap();
        assert!(find_install_image(temp.path())
            .unwrap()
            .ends_with("install.wim"));
    }
}
