//! Patches a Windows 11 ISO so Boot Camp Assistant accepts it as Windows 10.
//!
//! Boot Camp Assistant on pre-T2 Macs refuses Windows 11 media outright and
//! Windows 11 setup refuses the hardware. Both checks are metadata, not
//! capability, so this crate rewrites the metadata: it reads the identity of
//! a real Windows 10 ISO and stamps it onto the Windows 11 media, and plants
//! the setup-time hardware bypass flags in the boot image's registry.
//!
//! The work is split into:
//!
//! - **Metadata extraction** - volume label and version strings from the
//!   reference Windows 10 ISO ([`metadata`])
//! - **Registry patch planning** - a pure plan of hive writes ([`registry`])
//! - **Container rebuilds** - atomic-replace edits of `boot.wim` and
//!   `install.wim` ([`wim`])
//! - **ISO authoring** - external tools with fallback, ending in a built-in
//!   ISO 9660 writer ([`iso`])
//! - **Orchestration** - the end-to-end pipeline with cancellation and a
//!   machine-readable run report ([`pipeline`])
//!
//! All binary-format work is delegated to host tools (`wimlib-imagex`,
//! `hivexsh`, `xorriso`/`bsdtar`, `mkisofs`/`genisoimage`) through the
//! [`process::ToolRunner`] seam, so the pipeline itself is testable without
//! any of them installed.

pub mod error;
pub mod extract;
pub mod iso;
pub mod metadata;
pub mod pipeline;
pub mod policy;
pub mod preflight;
pub mod process;
pub mod progress;
pub mod registry;
pub mod report;
pub mod wim;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use error::PatchError;
pub use pipeline::{run, PatchOutcome, PatchRequest};
pub use policy::PatchPolicy;
pub use process::{CancelFlag, SystemRunner, ToolRunner};
pub use progress::{LogProgress, NullProgress, Progress};
