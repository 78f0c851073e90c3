//! Rootfs continuity between pipeline stages.
//!
//! pi-gen hands each stage its predecessor's rootfs via `PREV_ROOTFS_DIR`,
//! but upstream does not guarantee that directory exists or is non-empty
//! (a skipped stage leaves a hole). At the start of a synthesized stage the
//! resolver locates the most recent usable snapshot: the direct predecessor
//! when its rootfs is non-empty (`PRIMARY`), else the nearest earlier
//! ancestor (`FALLBACK`). No usable snapshot anywhere in the chain is
//! fatal; there is no filesystem to build on.
//!
//! The handoff is modeled as [`SnapshotRef`] rather than ad-hoc
//! directory-emptiness checks sprinkled through the callers.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

/// A stage's rootfs snapshot: present and non-empty, or unusable.
///
/// An empty directory is `Missing` by definition; an empty snapshot must
/// never be treated as ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotRef {
    Found(PathBuf),
    Missing,
}

impl SnapshotRef {
    /// Classify a stage work directory's `rootfs` subdirectory.
    pub fn of_stage_dir(stage_dir: &Path) -> Self {
        let rootfs = stage_dir.join("rootfs");
        if dir_is_nonempty(&rootfs) {
            SnapshotRef::Found(rootfs)
        } else {
            SnapshotRef::Missing
        }
    }
}

/// How the input snapshot for a stage was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuity {
    /// The immediate predecessor's snapshot was usable.
    Primary,
    /// Walked back to the named ancestor stage.
    Fallback { from: String },
}

/// Subtrees never carried forward between stages.
///
/// The apt package cache is regenerated and the boot firmware mount is
/// repopulated later; copying them wastes time and can carry stale state.
pub const COPY_EXCLUDES: &[&str] = &["var/cache/apt/archives", "boot/firmware"];

/// A snapshot counts as non-empty only if it holds at least one file or
/// symlink somewhere; a skeleton of empty directories is not a rootfs.
fn dir_is_nonempty(dir: &Path) -> bool {
    if !dir.is_dir() {
        return false;
    }
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .any(|entry| entry.file_type().is_file() || entry.file_type().is_symlink())
}

/// Pick the input snapshot for `current` from the ordered stage chain.
///
/// `stage_order` lists stage directory names from first to last;
/// `current` must appear in it. Returns the chosen snapshot path and
/// whether it came from the direct predecessor or a fallback ancestor.
pub fn select_snapshot(
    work_dir: &Path,
    stage_order: &[String],
    current: &str,
) -> Result<(PathBuf, Continuity)> {
    let position = stage_order
        .iter()
        .position(|name| name == current)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "stage '{}' is not in the pipeline order [{}]",
                current,
                stage_order.join(", ")
            )
        })?;
    if position == 0 {
        bail!("stage '{}' has no predecessor to take a rootfs from", current);
    }

    for (distance, ancestor) in stage_order[..position].iter().rev().enumerate() {
        match SnapshotRef::of_stage_dir(&work_dir.join(ancestor)) {
            SnapshotRef::Found(rootfs) => {
                let continuity = if distance == 0 {
                    Continuity::Primary
                } else {
                    Continuity::Fallback {
                        from: ancestor.clone(),
                    }
                };
                return Ok((rootfs, continuity));
            }
            SnapshotRef::Missing => continue,
        }
    }

    bail!(
        "no non-empty rootfs snapshot exists anywhere before stage '{}' under '{}'; \
         nothing to build on",
        current,
        work_dir.display()
    )
}

/// Copy the chosen snapshot into `dst`, recreating it from scratch.
///
/// Delegates to rsync to preserve permissions, ownership, extended
/// attributes and hard links; package-cache and firmware subtrees are
/// excluded. Ownership transfers by copy, never by move, so the source
/// snapshot stays valid for inspection.
pub fn materialize(src: &Path, dst: &Path) -> Result<()> {
    if dst.exists() {
        fs::remove_dir_all(dst).with_context(|| {
            format!("removing stale stage rootfs '{}'", dst.display())
        })?;
    }
    fs::create_dir_all(dst)
        .with_context(|| format!("creating stage rootfs '{}'", dst.display()))?;

    let mut cmd = Command::new("rsync");
    cmd.arg("-aHAXS");
    for exclude in COPY_EXCLUDES {
        cmd.arg(format!("--exclude=/{exclude}"));
    }
    // Trailing slash: copy contents, not the directory itself.
    cmd.arg(format!("{}/", src.display()));
    cmd.arg(dst);

    let output = cmd
        .output()
        .with_context(|| format!("running rsync '{}' -> '{}'", src.display(), dst.display()))?;
    if !output.status.success() {
        bail!(
            "rsync failed copying snapshot '{}' -> '{}': {}",
            src.display(),
            dst.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Resolve and materialize the input rootfs for `current`.
///
/// This is the entry point the synthesized host-side scripts call back
/// into (via the `resolve-rootfs` subcommand). When `verify` is set, an
/// empty destination after the copy is fatal: an unexpectedly empty
/// pass-through is indistinguishable from a real bug.
pub fn resolve_into(
    work_dir: &Path,
    stage_order: &[String],
    current: &str,
    dst: &Path,
    verify: bool,
) -> Result<Continuity> {
    let (snapshot, continuity) = select_snapshot(work_dir, stage_order, current)?;
    match &continuity {
        Continuity::Primary => {
            println!("[continuity] {}: using predecessor snapshot", current);
        }
        Continuity::Fallback { from } => {
            println!(
                "[continuity] {}: predecessor snapshot missing or empty, falling back to '{}'",
                current, from
            );
        }
    }

    materialize(&snapshot, dst)?;

    if verify && !dir_is_nonempty(dst) {
        bail!(
            "stage '{}' rootfs '{}' is empty after materializing snapshot '{}'",
            current,
            dst.display(),
            snapshot.display()
        );
    }
    Ok(continuity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn stage_names(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn seed_rootfs(work: &Path, stage: &str, files: &[&str]) {
        let rootfs = work.join(stage).join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();
        for file in files {
            let path = rootfs.join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, *file).unwrap();
        }
    }

    #[test]
    fn empty_directory_is_missing() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("stage1/rootfs")).unwrap();
        assert_eq!(
            SnapshotRef::of_stage_dir(&temp.path().join("stage1")),
            SnapshotRef::Missing
        );
        assert_eq!(
            SnapshotRef::of_stage_dir(&temp.path().join("absent")),
            SnapshotRef::Missing
        );
    }

    #[test]
    fn primary_when_predecessor_nonempty() {
        let temp = TempDir::new().unwrap();
        let order = stage_names(&["stage0", "stage1", "stage2"]);
        seed_rootfs(temp.path(), "stage1", &["etc/hostname"]);

        let (path, continuity) = select_snapshot(temp.path(), &order, "stage2").unwrap();
        assert_eq!(continuity, Continuity::Primary);
        assert!(path.ends_with("stage1/rootfs"));
    }

    #[test]
    fn fallback_skips_empty_predecessor() {
        let temp = TempDir::new().unwrap();
        let order = stage_names(&["stage0", "stage1", "stage2"]);
        seed_rootfs(temp.path(), "stage0", &["etc/hostname"]);
        // stage1 exists but produced nothing.
        fs::create_dir_all(temp.path().join("stage1/rootfs")).unwrap();

        let (path, continuity) = select_snapshot(temp.path(), &order, "stage2").unwrap();
        assert_eq!(
            continuity,
            Continuity::Fallback {
                from: "stage0".to_string()
            }
        );
        assert!(path.ends_with("stage0/rootfs"));
    }

    #[test]
    fn empty_chain_is_fatal() {
        let temp = TempDir::new().unwrap();
        let order = stage_names(&["stage0", "stage1", "stage2"]);
        let result = select_snapshot(temp.path(), &order, "stage2");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("nothing to build on"));
    }

    #[test]
    fn first_stage_has_no_predecessor() {
        let temp = TempDir::new().unwrap();
        let order = stage_names(&["stage0", "stage1"]);
        assert!(select_snapshot(temp.path(), &order, "stage0").is_err());
    }

    #[test]
    fn unknown_stage_rejected() {
        let temp = TempDir::new().unwrap();
        let order = stage_names(&["stage0"]);
        assert!(select_snapshot(temp.path(), &order, "stageX").is_err());
    }

    #[test]
    fn materialize_copies_and_excludes_caches() {
        if which::which("rsync").is_err() {
            eprintln!("rsync not installed; skipping");
            return;
        }
        let temp = TempDir::new().unwrap();
        seed_rootfs(
            temp.path(),
            "stage1",
            &[
                "etc/hostname",
                "var/cache/apt/archives/foo.deb",
                "boot/firmware/start.elf",
                "boot/cmdline.txt",
            ],
        );
        let src = temp.path().join("stage1/rootfs");
        let dst = temp.path().join("stage2/rootfs");

        materialize(&src, &dst).unwrap();

        assert!(dst.join("etc/hostname").is_file());
        assert!(dst.join("boot/cmdline.txt").is_file());
        assert!(!dst.join("var/cache/apt/archives/foo.deb").exists());
        assert!(!dst.join("boot/firmware/start.elf").exists());
        // Source snapshot stays intact (copy, never move).
        assert!(src.join("etc/hostname").is_file());
    }

    #[test]
    fn resolve_into_verifies_nonempty_result() {
        if which::which("rsync").is_err() {
            eprintln!("rsync not installed; skipping");
            return;
        }
        let temp = TempDir::new().unwrap();
        let order = stage_names(&["stage0", "stage1"]);
        seed_rootfs(temp.path(), "stage0", &["etc/hostname"]);
        let dst = temp.path().join("stage1/rootfs");

        let continuity =
            resolve_into(temp.path(), &order, "stage1", &dst, true).unwrap();
        assert_eq!(continuity, Continuity::Primary);
        assert!(dst.join("etc/hostname").is_file());
    }
}
