//! Orchestrator for building customized Raspberry Pi OS images with pi-gen.
//!
//! pi-gen does the actual stage execution; this crate does everything the
//! upstream builder does not guarantee:
//!
//! - **Configuration** - merge base settings with an optional override
//! - **Trust bootstrapping** - repair repository trust before the builder's
//!   own apt configuration step runs
//! - **Manifest patching** - drop packages from the builder's stock stage
//!   package lists without disturbing their neighbors
//! - **Stage synthesis** - generate the custom stage directories the
//!   builder consumes
//! - **Rootfs continuity** - locate the most recent usable filesystem
//!   snapshot when the upstream handoff leaves a hole
//! - **Retry** - bounded exponential backoff around network operations
//! - **Artifacts** - checksums, optional compression, and a build record
//!
//! # Architecture
//!
//! ```text
//! pi-forge (this crate)
//!     │
//!     ├── pipeline: load config -> preflight -> checkout -> patch ->
//!     │             synthesize -> run builder -> collect artifacts
//!     │
//!     └── pi-gen (external, black box)
//!             └── runs stock + synthesized stages; synthesized host-side
//!                 scripts call back into `pi-forge resolve-rootfs`
//! ```
//!
//! The pipeline is strictly sequential: each stage consumes the filesystem
//! state the previous stage produced. All state lives on disk.

pub mod artifact;
pub mod config;
pub mod continuity;
pub mod manifest;
pub mod pigen;
pub mod pipeline;
pub mod preflight;
pub mod retry;
pub mod synth;
pub mod trust;

pub use config::BuildConfig;
pub use continuity::SnapshotRef;
pub use pipeline::{run, PipelineOptions};
pub use retry::RetryPolicy;
