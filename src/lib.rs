//! Resumable compose pipeline for verity-protected unified kernel images.
//!
//! A run submits a blueprint to a remote image-builder service, downloads
//! the resulting raw disk image, lifts the kernel, initramfs and root
//! filesystem out of it, builds a dm-verity hash tree over the root, and
//! wraps kernel, initramfs, command line and os-release into a single EFI
//! executable.
//!
//! # Architecture
//!
//! ```text
//! uki-compose (binary)
//!     │
//!     └── pipeline::Pipeline ── runs phases in order, skips committed ones
//!             │
//!             ├── remote     submit / poll / download (weldr API)
//!             ├── extract    guest filesystem access (guestfish)
//!             ├── integrity  veritysetup format + report parsing
//!             ├── assemble   cmdline, combined volume, objcopy UKI
//!             └── boottest   optional QEMU boot of a GPT test disk
//!
//! checkpoint::CheckpointStore ── one write-once file per artifact
//! ```
//!
//! Every phase reads its inputs from and commits its outputs to the
//! checkpoint store, so an interrupted run picks up at the first phase whose
//! outputs are missing.

pub mod assemble;
pub mod blueprint;
pub mod boottest;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod error;
pub mod extract;
pub mod integrity;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod remote;
pub mod source;

pub use checkpoint::{Artifact, CheckpointStore};
pub use config::{load_config, ComposeConfig};
pub use error::{ComposeError, Result};
pub use pipeline::{ComposeContext, ComposeRun, Pipeline, RunSummary};
