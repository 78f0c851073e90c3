//! Integration with pi-gen, the upstream base image builder.
//!
//! pi-gen is treated as a black box: the orchestrator gives it a checkout
//! at the right branch, a `config` file, and a directory of extra stage
//! directories, then invokes `build.sh` (or `build-docker.sh`) as one
//! long-running blocking subprocess. It never interprets failures inside
//! the builder; a non-zero exit surfaces the builder's own log tail.

use anyhow::{bail, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::config::BuildConfig;
use crate::retry::{run_with_retry, RetryPolicy};

/// Upstream repository cloned when the configuration does not name one.
pub const DEFAULT_REPO: &str = "https://github.com/RPi-Distro/pi-gen.git";

/// Map target architecture and release to the upstream branch.
///
/// The 64-bit builder lives on its own branch; the 32-bit builder tracks
/// `master` for current releases and keeps a frozen branch for the legacy
/// release.
pub fn branch_for(architecture: &str, release: &str) -> Result<&'static str> {
    match (architecture, release) {
        ("arm64", "buster") => bail!(
            "release 'buster' has no 64-bit builder branch; use armhf or a newer release"
        ),
        ("arm64", _) => Ok("arm64"),
        ("armhf", "buster") => Ok("buster"),
        ("armhf", _) => Ok("master"),
        (other, _) => bail!(
            "unsupported ARCHITECTURE '{}' (expected 'armhf' or 'arm64')",
            other
        ),
    }
}

/// Clone the builder, or bring an existing checkout to the wanted branch.
///
/// An existing directory that is not a git checkout is fatal rather than
/// silently re-cloned over. Fresh clones are shallow and single-branch, so
/// updating an existing checkout first widens the remote tracking config to
/// the wanted branch; a configuration change that switches branches between
/// runs then works against the same checkout. Fresh clones go through the
/// retry executor with target-directory cleanup, so a half-written clone
/// from a failed attempt never poisons the next one.
pub fn ensure_checkout(
    repo: &str,
    branch: &str,
    dest: &Path,
    policy: RetryPolicy,
) -> Result<()> {
    if dest.exists() && !dest.join(".git").exists() {
        bail!(
            "builder directory '{}' exists but is not a git checkout; \
             remove it or run with --clean",
            dest.display()
        );
    }

    if dest.join(".git").exists() {
        println!("[pigen] updating existing checkout at {}", dest.display());
        let widen = Command::new("git")
            .arg("-C")
            .arg(dest)
            .args(["remote", "set-branches", "origin", branch])
            .status()
            .with_context(|| format!("configuring origin branches in {}", dest.display()))?;
        if !widen.success() {
            bail!(
                "git remote set-branches origin {} failed in '{}'",
                branch,
                dest.display()
            );
        }

        run_with_retry(policy, "pi-gen fetch", None, || {
            let mut cmd = Command::new("git");
            cmd.args(["-C"])
                .arg(dest)
                .args(["fetch", "--tags", "--prune", "origin"]);
            cmd
        })?;

        let checkout = Command::new("git")
            .arg("-C")
            .arg(dest)
            .args(["checkout", "--force", "-B", branch, &format!("origin/{branch}")])
            .status()
            .with_context(|| format!("checking out branch '{}' in {}", branch, dest.display()))?;
        if !checkout.success() {
            bail!(
                "git checkout of origin/{} failed in '{}'",
                branch,
                dest.display()
            );
        }
    } else {
        println!(
            "[pigen] cloning {} (branch {}) into {}",
            repo,
            branch,
            dest.display()
        );
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating '{}'", parent.display()))?;
        }
        let repo = repo.to_string();
        let branch = branch.to_string();
        let dest_buf = dest.to_path_buf();
        run_with_retry(policy, "pi-gen clone", Some(dest), move || {
            let mut cmd = Command::new("git");
            cmd.args(["clone", "--branch", &branch, "--depth", "1"])
                .arg(&repo)
                .arg(&dest_buf);
            cmd
        })?;
    }

    Ok(())
}

/// Write pi-gen's `config` file from the merged settings.
///
/// Every setting passes through (the builder and the chroot scripts expect
/// them as environment), with the computed keys layered on top: the stage
/// list (stock stage names plus absolute paths of synthesized stages), the
/// work directory, and the path of this binary so synthesized scripts can
/// call back into the continuity resolver.
///
/// Orchestrator-level keys are held back. `DEPLOY_DIR` and `PIGEN_DIR`
/// steer where the orchestrator puts things; inside pi-gen the same names
/// mean the builder's own directories, and redirecting those would move
/// the builder output away from where collection looks for it.
pub fn write_builder_config(
    config: &BuildConfig,
    pigen_dir: &Path,
    work_dir: &Path,
    stage_list: &[String],
) -> Result<PathBuf> {
    let mut lines: Vec<String> = Vec::new();
    let held_back = [
        "STAGE_LIST",
        "WORK_DIR",
        "PI_FORGE_BIN",
        "DEPLOY_DIR",
        "PIGEN_DIR",
    ];
    for (key, value) in config.iter() {
        if held_back.contains(&key) {
            continue;
        }
        lines.push(format!("{}={}", key, shell_quote(value)));
    }

    let self_bin = std::env::current_exe().context("resolving pi-forge executable path")?;
    lines.push(format!("STAGE_LIST={}", shell_quote(&stage_list.join(" "))));
    lines.push(format!(
        "WORK_DIR={}",
        shell_quote(&work_dir.display().to_string())
    ));
    lines.push(format!(
        "PI_FORGE_BIN={}",
        shell_quote(&self_bin.display().to_string())
    ));

    let config_path = pigen_dir.join("config");
    fs::write(&config_path, format!("{}\n", lines.join("\n")))
        .with_context(|| format!("writing builder config '{}'", config_path.display()))?;
    Ok(config_path)
}

/// Quote a value for a file that bash will source.
///
/// Single quotes keep `$`, backticks, and backslashes literal; double
/// quotes would let the shell expand them and silently corrupt values
/// like user passwords.
fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-/=:,".contains(c))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

/// Run the builder to completion, streaming its output to `log_path`.
///
/// This call commonly blocks for hours. On failure the last lines of the
/// log are surfaced verbatim; the builder has no resumable checkpoint
/// contract, so no recovery is attempted here.
pub fn run_builder(
    pigen_dir: &Path,
    config: &BuildConfig,
    docker: bool,
    log_path: &Path,
) -> Result<()> {
    let script = if docker { "build-docker.sh" } else { "build.sh" };
    let script_path = pigen_dir.join(script);
    if !script_path.is_file() {
        bail!(
            "builder entry point '{}' not found; incomplete checkout?",
            script_path.display()
        );
    }

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory '{}'", parent.display()))?;
    }
    let log = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_path)
        .with_context(|| format!("opening build log '{}'", log_path.display()))?;
    let log_err = log
        .try_clone()
        .with_context(|| format!("cloning log handle '{}'", log_path.display()))?;

    println!(
        "[pigen] running {} (output -> {})",
        script,
        log_path.display()
    );

    let mut cmd = Command::new("bash");
    cmd.arg(script)
        .current_dir(pigen_dir)
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    config.apply_env(&mut cmd);

    let status = cmd
        .status()
        .with_context(|| format!("running builder '{}'", script_path.display()))?;

    if !status.success() {
        bail!(
            "base builder failed with {}; last output:\n{}",
            status,
            log_tail(log_path, 40).unwrap_or_else(|_| "<log unreadable>".to_string())
        );
    }
    Ok(())
}

/// Last `lines` lines of the build log, for failure reporting.
pub fn log_tail(log_path: &Path, lines: usize) -> Result<String> {
    let file = File::open(log_path)
        .with_context(|| format!("opening build log '{}'", log_path.display()))?;
    let all: Vec<String> = BufReader::new(file)
        .lines()
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("reading build log '{}'", log_path.display()))?;
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn config_with(content: &str) -> BuildConfig {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("config");
        fs::write(&base, content).unwrap();
        BuildConfig::load(&base, None).unwrap()
    }

    #[test]
    fn arm64_selects_64bit_branch() {
        assert_eq!(branch_for("arm64", "bookworm").unwrap(), "arm64");
        assert_eq!(branch_for("arm64", "bullseye").unwrap(), "arm64");
    }

    #[test]
    fn armhf_tracks_master_except_legacy_release() {
        assert_eq!(branch_for("armhf", "bookworm").unwrap(), "master");
        assert_eq!(branch_for("armhf", "buster").unwrap(), "buster");
    }

    #[test]
    fn unsupported_combinations_rejected() {
        assert!(branch_for("arm64", "buster").is_err());
        assert!(branch_for("riscv64", "bookworm").is_err());
    }

    #[test]
    fn existing_non_git_dir_is_fatal() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("pi-gen");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("somefile"), "not a repo").unwrap();

        let result = ensure_checkout(
            "file:///nonexistent",
            "master",
            &dest,
            RetryPolicy {
                max_attempts: 1,
                initial_delay: std::time::Duration::from_millis(1),
            },
        );
        assert!(result.is_err());
        // The directory is left alone for the operator to inspect.
        assert!(dest.join("somefile").exists());
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["-c", "user.name=pi", "-c", "user.email=pi@example.invalid"])
            .args(args)
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed in {}", dir.display());
    }

    #[test]
    fn existing_shallow_clone_can_switch_branches() {
        if which::which("git").is_err() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let upstream = temp.path().join("upstream");
        fs::create_dir_all(&upstream).unwrap();
        git(&upstream, &["init", "-q"]);
        git(&upstream, &["symbolic-ref", "HEAD", "refs/heads/master"]);
        fs::write(upstream.join("VERSION"), "master\n").unwrap();
        git(&upstream, &["add", "VERSION"]);
        git(&upstream, &["commit", "-q", "-m", "master version"]);
        git(&upstream, &["checkout", "-q", "-b", "arm64"]);
        fs::write(upstream.join("VERSION"), "arm64\n").unwrap();
        git(&upstream, &["commit", "-q", "-am", "arm64 version"]);
        git(&upstream, &["checkout", "-q", "master"]);

        let url = format!("file://{}", upstream.display());
        let dest = temp.path().join("pi-gen");
        let policy = RetryPolicy {
            max_attempts: 1,
            initial_delay: std::time::Duration::from_millis(1),
        };

        ensure_checkout(&url, "master", &dest, policy).unwrap();
        assert_eq!(fs::read_to_string(dest.join("VERSION")).unwrap(), "master\n");

        // Same checkout, different branch: the single-branch shallow clone
        // gets widened to the new branch instead of failing the checkout.
        ensure_checkout(&url, "arm64", &dest, policy).unwrap();
        assert_eq!(fs::read_to_string(dest.join("VERSION")).unwrap(), "arm64\n");
    }

    #[test]
    fn builder_config_contains_settings_and_computed_keys() {
        let temp = TempDir::new().unwrap();
        let config = config_with("IMG_NAME=demo\nRELEASE=bookworm\nFIRST_USER_NAME=pi\n");
        let work = temp.path().join("work");
        let stage_list = vec![
            "stage0".to_string(),
            "stage1".to_string(),
            "/tmp/stages/stage-app".to_string(),
        ];

        let path =
            write_builder_config(&config, temp.path(), &work, &stage_list).unwrap();
        let written = fs::read_to_string(&path).unwrap();

        assert!(written.contains("IMG_NAME=demo"));
        assert!(written.contains("RELEASE=bookworm"));
        assert!(written.contains("STAGE_LIST='stage0 stage1 /tmp/stages/stage-app'"));
        assert!(written.contains("PI_FORGE_BIN="));
        assert!(written.contains("WORK_DIR="));
    }

    #[test]
    fn builder_config_quotes_unsafe_values() {
        let temp = TempDir::new().unwrap();
        let config = config_with("FIRST_USER_PASS=s3cret pass\n");
        let path = write_builder_config(&config, temp.path(), temp.path(), &[]).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("FIRST_USER_PASS='s3cret pass'"));
    }

    #[test]
    fn builder_config_values_survive_shell_sourcing() {
        // The builder sources this file with bash; metacharacters in a
        // value must come back out byte for byte.
        let temp = TempDir::new().unwrap();
        let config = config_with("FIRST_USER_PASS=pa$word `x` it's\n");
        let path = write_builder_config(&config, temp.path(), temp.path(), &[]).unwrap();

        let out = Command::new("bash")
            .arg("-c")
            .arg(format!(
                ". '{}' && printf %s \"$FIRST_USER_PASS\"",
                path.display()
            ))
            .output()
            .unwrap();
        assert!(out.status.success());
        assert_eq!(String::from_utf8_lossy(&out.stdout), "pa$word `x` it's");
    }

    #[test]
    fn orchestrator_directory_keys_not_passed_to_builder() {
        // DEPLOY_DIR / PIGEN_DIR configure this orchestrator; inside
        // pi-gen they would redirect the builder's own output away from
        // where artifact collection looks.
        let temp = TempDir::new().unwrap();
        let config = config_with("IMG_NAME=demo\nDEPLOY_DIR=/srv/out\nPIGEN_DIR=/srv/pi-gen\n");
        let path = write_builder_config(&config, temp.path(), temp.path(), &[]).unwrap();
        let written = fs::read_to_string(&path).unwrap();

        assert!(written.contains("IMG_NAME=demo"));
        assert!(!written.contains("DEPLOY_DIR"));
        assert!(!written.contains("PIGEN_DIR"));
    }

    #[test]
    fn missing_entry_point_is_fatal() {
        let temp = TempDir::new().unwrap();
        let config = config_with("IMG_NAME=demo\n");
        let log = temp.path().join("build.log");
        let result = run_builder(temp.path(), &config, false, &log);
        assert!(result.unwrap_err().to_string().contains("build.sh"));
    }

    #[test]
    fn failed_builder_surfaces_log_tail() {
        let temp = TempDir::new().unwrap();
        let config = config_with("IMG_NAME=demo\n");
        fs::write(
            temp.path().join("build.sh"),
            "echo stage0 ok\necho 'fatal: rootfs exploded' >&2\nexit 3\n",
        )
        .unwrap();
        let log = temp.path().join("build.log");

        let err = run_builder(temp.path(), &config, false, &log)
            .unwrap_err()
            .to_string();
        assert!(err.contains("rootfs exploded"), "got: {err}");
        // Full log retained on disk.
        let logged = fs::read_to_string(&log).unwrap();
        assert!(logged.contains("stage0 ok"));
    }

    #[test]
    fn successful_builder_streams_to_log() {
        let temp = TempDir::new().unwrap();
        let config = config_with("IMG_NAME=demo\n");
        fs::write(temp.path().join("build.sh"), "echo IMG_NAME=$IMG_NAME\n").unwrap();
        let log = temp.path().join("build.log");

        run_builder(temp.path(), &config, false, &log).unwrap();
        // Settings travel to the builder as environment variables.
        assert!(fs::read_to_string(&log).unwrap().contains("IMG_NAME=demo"));
    }
}
