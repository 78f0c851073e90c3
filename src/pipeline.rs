//! The pipeline driver: one linear run from settings to disk image.
//!
//! Sequencing is fixed: load configuration, preflight the host, clean if
//! asked, bring the base builder to the right branch, fix the builder's
//! own trust step and package manifests, synthesize the custom stages,
//! hand everything to the builder, and collect what it deployed. Every
//! fatal condition exits through the error chain; there is no partial
//! recovery, because the builder has no resumable checkpoint contract.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::artifact;
use crate::config::BuildConfig;
use crate::manifest;
use crate::pigen;
use crate::preflight;
use crate::retry::RetryPolicy;
use crate::synth::{self, Stage};
use crate::trust;

/// Options parsed from the command line.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Settings override file (`--config`), applied on top of `config`.
    pub config_override: Option<PathBuf>,
    /// Delegate the builder invocation to `build-docker.sh`.
    pub docker: bool,
    /// Purge prior stage and work directories before starting.
    pub clean: bool,
    /// Advisory: truncate the stage list after the named stage.
    pub only_stage: Option<String>,
}

/// Filesystem layout of one pipeline run under `base_dir`.
#[derive(Debug, Clone)]
pub struct Layout {
    pub pigen_dir: PathBuf,
    pub stage_root: PathBuf,
    pub work_dir: PathBuf,
    pub deploy_dir: PathBuf,
    pub log_path: PathBuf,
}

impl Layout {
    pub fn resolve(base_dir: &Path, config: &BuildConfig) -> Self {
        let pigen_dir = base_dir.join(config.get_or("PIGEN_DIR", "pi-gen"));
        let work_dir = base_dir.join(config.get_or("WORK_DIR", "work"));
        let deploy_dir = base_dir.join(config.get_or("DEPLOY_DIR", "deploy"));
        Self {
            stage_root: base_dir.join("stages"),
            log_path: deploy_dir.join("build.log"),
            pigen_dir,
            work_dir,
            deploy_dir,
        }
    }
}

/// Run the whole pipeline once. Exits non-zero upstream on any `Err`.
pub fn run(base_dir: &Path, opts: &PipelineOptions) -> Result<()> {
    let started_at = artifact::now_utc()?;

    let base_settings = base_dir.join("config");
    let config = BuildConfig::load(&base_settings, opts.config_override.as_deref())?;
    let layout = Layout::resolve(base_dir, &config);

    // Environment checks come before any network or filesystem work.
    preflight::check_host_tools(opts.docker)?;
    preflight::ensure_free_space(base_dir, config.required_free_gb()?)?;
    println!("[pipeline] preflight ok");

    if opts.clean {
        clean_previous_output(&layout)?;
    }

    let branch = pigen::branch_for(config.architecture(), config.release())?;
    println!(
        "[pipeline] target {}/{} -> builder branch '{}'",
        config.architecture(),
        config.release(),
        branch
    );

    let repo = config.get_or("PIGEN_REPO", pigen::DEFAULT_REPO);
    pigen::ensure_checkout(repo, branch, &layout.pigen_dir, RetryPolicy::default())?;

    // Build-time fixes to the cloned builder itself, before it ever
    // touches the target image.
    trust::inject(&layout.pigen_dir, &config)?;
    patch_builder_manifests(&layout.pigen_dir, &config)?;

    let stages = synth::plan_stages(&config)?;
    synth::write_stages(&layout.stage_root, &stages)?;

    let mut stage_list = builder_stage_list(&layout.stage_root, &stages);
    if let Some(only) = &opts.only_stage {
        stage_list = truncate_stage_list(stage_list, only)?;
        println!("[pipeline] stage list truncated at '{}'", only);
    }

    pigen::write_builder_config(&config, &layout.pigen_dir, &layout.work_dir, &stage_list)?;

    fs::create_dir_all(&layout.deploy_dir).with_context(|| {
        format!("creating deploy directory '{}'", layout.deploy_dir.display())
    })?;
    pigen::run_builder(&layout.pigen_dir, &config, opts.docker, &layout.log_path)?;

    let record = artifact::collect_artifacts(
        &layout.pigen_dir.join("deploy"),
        &layout.deploy_dir,
        &config,
        branch,
        &stage_list,
        &started_at,
    )?;

    println!(
        "[pipeline] build finished: {} image(s) in {}",
        record.images.len(),
        layout.deploy_dir.display()
    );
    Ok(())
}

/// Remove prior stage output and work directories (`--clean`).
///
/// A killed pipeline leaves partial on-disk stage output behind; it must
/// be discarded, not resumed. The builder checkout itself is kept.
pub fn clean_previous_output(layout: &Layout) -> Result<()> {
    for dir in [&layout.work_dir, &layout.stage_root] {
        if dir.exists() {
            println!("[pipeline] clean: removing {}", dir.display());
            fs::remove_dir_all(dir)
                .with_context(|| format!("removing '{}'", dir.display()))?;
        }
    }
    let builder_work = layout.pigen_dir.join("work");
    if builder_work.exists() {
        println!("[pipeline] clean: removing {}", builder_work.display());
        fs::remove_dir_all(&builder_work)
            .with_context(|| format!("removing '{}'", builder_work.display()))?;
    }
    Ok(())
}

/// Remove configured packages from the builder's own stage manifests.
///
/// These edits fix the *builder's* package lists (a build-time problem),
/// not the target filesystem. Files follow pi-gen's `NN-packages` naming.
fn patch_builder_manifests(pigen_dir: &Path, config: &BuildConfig) -> Result<()> {
    let raw = config.get_or("REMOVE_PACKAGES", "");
    let packages: Vec<&str> = raw.split_whitespace().collect();
    if packages.is_empty() {
        println!("[pipeline] no packages configured for removal; manifests untouched");
        return Ok(());
    }

    let mut total = 0usize;
    for entry in WalkDir::new(pigen_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
    {
        let name = entry.file_name().to_string_lossy();
        if !is_manifest_filename(&name) {
            continue;
        }
        total += manifest::remove_packages(entry.path(), &packages)?;
    }
    println!(
        "[pipeline] removed {} package token(s) for [{}] from builder manifests",
        total,
        packages.join(", ")
    );
    Ok(())
}

/// pi-gen package manifests are named like `00-packages`, `00-packages-nr`.
fn is_manifest_filename(name: &str) -> bool {
    let mut chars = name.chars();
    let leading_digits = matches!(
        (chars.next(), chars.next()),
        (Some(a), Some(b)) if a.is_ascii_digit() && b.is_ascii_digit()
    );
    leading_digits && name[2..].starts_with("-packages")
}

/// Stock stage names plus absolute paths of the synthesized stages.
fn builder_stage_list(stage_root: &Path, stages: &[Stage]) -> Vec<String> {
    synth::STOCK_STAGES
        .iter()
        .map(|s| s.to_string())
        .chain(
            stages
                .iter()
                .map(|s| stage_root.join(&s.name).display().to_string()),
        )
        .collect()
}

/// Keep stages up to and including `last`; unknown names are fatal.
fn truncate_stage_list(stage_list: Vec<String>, last: &str) -> Result<Vec<String>> {
    let position = stage_list
        .iter()
        .position(|entry| entry == last || entry.ends_with(&format!("/{last}")));
    match position {
        Some(index) => Ok(stage_list.into_iter().take(index + 1).collect()),
        None => bail!(
            "--stage '{}' does not name a pipeline stage; known stages: [{}]",
            last,
            stage_list.join(", ")
        ),
    }
}
