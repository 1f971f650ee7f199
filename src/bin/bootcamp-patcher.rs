use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use bootcamp_patcher::preflight::{
    command_exists, AUTHORING_TOOLS, EXTRACTION_TOOLS, REQUIRED_TOOLS,
};
use bootcamp_patcher::{
    preflight, CancelFlag, LogProgress, PatchError, PatchPolicy, PatchRequest, SystemRunner,
};
use tracing_subscriber::EnvFilter;

fn usage() -> &'static str {
    "Usage:\n  bootcamp-patcher <windows11.iso> <windows10.iso> [output.iso] [--policy <file>]\n  bootcamp-patcher preflight"
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = real_main() {
        eprintln!("error: {e:#}");
        let code = e
            .downcast_ref::<PatchError>()
            .map(PatchError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

fn real_main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut positional: Vec<String> = Vec::new();
    let mut policy_path: Option<PathBuf> = None;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--policy" => match iter.next() {
                Some(path) => policy_path = Some(PathBuf::from(path)),
                None => bail!("--policy requires a file argument\n{}", usage()),
            },
            "-h" | "--help" => {
                println!("{}", usage());
                return Ok(());
            }
            flag if flag.starts_with('-') => bail!("unknown flag '{}'\n{}", flag, usage()),
            _ => positional.push(arg),
        }
    }

    match positional.as_slice() {
        [cmd] if cmd == "preflight" => run_preflight(),
        [target, reference] => run_patch(target, reference, None, policy_path),
        [target, reference, output] => run_patch(target, reference, Some(output), policy_path),
        _ => bail!(usage()),
    }
}

fn run_patch(
    target: &str,
    reference: &str,
    output: Option<&str>,
    policy_path: Option<PathBuf>,
) -> Result<()> {
    let policy = match policy_path {
        Some(path) => PatchPolicy::load(&path)?,
        None => PatchPolicy::default(),
    };

    let target_iso = PathBuf::from(target);
    let output_iso = match output {
        Some(path) => PathBuf::from(path),
        None => default_output_path(&target_iso),
    };

    let req = PatchRequest {
        target_iso,
        reference_iso: PathBuf::from(reference),
        output_iso,
        policy,
    };

    let outcome = bootcamp_patcher::run(&SystemRunner::new(), &req, &CancelFlag::new(), &LogProgress)?;

    println!("patched image: {}", outcome.output_iso.display());
    println!("run report:    {}", outcome.report_path.display());
    println!(
        "spoofed as:    {} (build {})",
        outcome.report.spoofed_product_name, outcome.report.spoofed_build_number
    );
    Ok(())
}

/// `win11.iso` becomes `win11-patched.iso` next to the input.
fn default_output_path(target: &Path) -> PathBuf {
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    target.with_file_name(format!("{stem}-patched.iso"))
}

fn run_preflight() -> Result<()> {
    for (group, tools) in [
        ("required", REQUIRED_TOOLS),
        ("extraction (any one)", EXTRACTION_TOOLS),
        ("authoring (optional)", AUTHORING_TOOLS),
    ] {
        println!("{group}:");
        for (tool, formula) in tools {
            if command_exists(tool) {
                println!("  {tool:<16} ok");
            } else {
                println!("  {tool:<16} missing (brew install {formula})");
            }
        }
    }
    preflight::check_host_tools(&SystemRunner::new())?;
    println!("host is ready");
    Ok(())
}
