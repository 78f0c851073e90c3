//! Preflight checks run before any network or filesystem work.
//!
//! Image builds run for hours; a missing host tool or a disk that fills up
//! halfway through is far more expensive to diagnose mid-build than here.
//! Environment errors are fatal and never retried.

use anyhow::{bail, Context, Result};
use std::path::Path;

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools the orchestrator itself needs, as (command, package) pairs.
///
/// pi-gen validates its own much longer dependency list; these are only
/// the tools this process invokes directly.
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("git", "git"),
    ("rsync", "rsync"),
    ("bash", "bash"),
];

/// Required additionally when the build is delegated to a container.
pub const DOCKER_TOOLS: &[(&str, &str)] = &[("docker", "docker.io")];

/// Check that specific tools are available.
///
/// Returns `Err` listing every missing tool with its install package.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();
    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }
    Ok(())
}

/// Check all orchestrator tools, plus docker when requested.
pub fn check_host_tools(docker: bool) -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)?;
    if docker {
        check_required_tools(DOCKER_TOOLS)?;
    }
    Ok(())
}

/// Threshold comparison, split out so it is testable without a real disk.
pub fn has_enough_space(available_bytes: u64, required_gb: u64) -> bool {
    available_bytes >= required_gb.saturating_mul(1024 * 1024 * 1024)
}

/// Fail unless the filesystem holding `path` has `required_gb` free.
pub fn ensure_free_space(path: &Path, required_gb: u64) -> Result<()> {
    let available = fs2::available_space(path)
        .with_context(|| format!("querying free space for '{}'", path.display()))?;

    if !has_enough_space(available, required_gb) {
        bail!(
            "insufficient disk space on '{}': {} GiB available, {} GiB required \
             (set REQUIRED_FREE_GB to adjust)",
            path.display(),
            available / (1024 * 1024 * 1024),
            required_gb
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_tools_through_path_lookup() {
        // sh is on every host this orchestrator supports.
        assert!(command_exists("sh"));
        assert!(!command_exists("pi-forge-no-such-tool"));
    }

    #[test]
    fn present_tool_set_passes() {
        assert!(check_required_tools(&[("sh", "dash"), ("env", "coreutils")]).is_ok());
    }

    #[test]
    fn every_missing_tool_named_with_its_package() {
        let tools = &[
            ("sh", "dash"),
            ("pi-forge-phantom-a", "phantom-a-pkg"),
            ("pi-forge-phantom-b", "phantom-b-pkg"),
        ];
        let err = check_required_tools(tools).unwrap_err().to_string();
        // One aggregated report, not just the first miss.
        assert!(err.contains("pi-forge-phantom-a (install: phantom-a-pkg)"));
        assert!(err.contains("pi-forge-phantom-b (install: phantom-b-pkg)"));
        assert!(!err.contains("dash"));
    }

    #[test]
    fn space_threshold() {
        const GIB: u64 = 1024 * 1024 * 1024;
        assert!(has_enough_space(16 * GIB, 16));
        assert!(!has_enough_space(16 * GIB - 1, 16));
        assert!(has_enough_space(0, 0));
    }

    #[test]
    fn ensure_free_space_rejects_absurd_requirement() {
        // No build host has an exbibyte free.
        let result = ensure_free_space(std::path::Path::new("/"), u64::MAX / (1024 * 1024 * 1024));
        assert!(result.is_err());
    }
}
