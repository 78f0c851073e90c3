//! Package-manifest patching.
//!
//! pi-gen stages list their apt packages in whitespace-delimited files
//! (`00-packages`, `00-packages-nr`). Dropping a package from a stock stage
//! means editing those files in the cloned builder tree without disturbing
//! the sibling packages on the same line.
//!
//! Matching is whole-token only: removing `bar` must not touch `rebar` or
//! `bar-utils`. Lines that lose all their tokens are dropped; comment lines
//! are kept verbatim. The rewrite is idempotent, and a verification pass
//! confirms the postcondition (a failure there is a bug in this module, not
//! in the data, and aborts the pipeline).

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

/// Remove whole-token occurrences of `packages` from a manifest file.
///
/// Returns the number of tokens removed. The file is rewritten in place and
/// verified afterwards; a target token still present as a whole word after
/// the rewrite is a fatal internal error.
pub fn remove_packages(path: &Path, packages: &[&str]) -> Result<usize> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading package manifest '{}'", path.display()))?;

    let (patched, removed) = strip_tokens(&content, packages);
    if removed > 0 {
        fs::write(path, &patched)
            .with_context(|| format!("rewriting package manifest '{}'", path.display()))?;
    }

    verify_absent(path, packages)?;
    Ok(removed)
}

/// Pure rewrite: drop matching tokens, keep everything else in order.
pub fn strip_tokens(content: &str, packages: &[&str]) -> (String, usize) {
    let mut removed = 0usize;
    let mut lines = Vec::new();

    for line in content.lines() {
        if line.trim_start().starts_with('#') {
            lines.push(line.to_string());
            continue;
        }
        let kept: Vec<&str> = line
            .split_whitespace()
            .filter(|token| {
                if packages.contains(token) {
                    removed += 1;
                    false
                } else {
                    true
                }
            })
            .collect();
        if !kept.is_empty() {
            lines.push(kept.join(" "));
        }
    }

    let mut patched = lines.join("\n");
    if !patched.is_empty() {
        patched.push('\n');
    }
    (patched, removed)
}

/// Confirm none of `packages` survives as a whole word on a package line.
///
/// Comment lines are exempt, matching the rewrite: a comment is free to
/// mention a removed package by name.
pub fn verify_absent(path: &Path, packages: &[&str]) -> Result<()> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("re-reading package manifest '{}'", path.display()))?;

    for line in content.lines() {
        if line.trim_start().starts_with('#') {
            continue;
        }
        for token in line.split_whitespace() {
            if packages.contains(&token) {
                bail!(
                    "manifest patch postcondition violated: '{}' still present in '{}' \
                     (patch logic is broken; aborting)",
                    token,
                    path.display()
                );
            }
        }
    }
    Ok(())
}
