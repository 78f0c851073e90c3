//! Bounded exponential-backoff retry for external commands.
//!
//! Network operations (git clone/fetch) fail transiently; everything else
//! in the pipeline fails deterministically and is never retried. A failed
//! clone attempt can leave a partially-populated target directory behind,
//! and retrying `git clone` into a non-empty directory fails for a second,
//! unrelated reason. The executor therefore deletes the target directory
//! between attempts.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

/// Retry bounds for one retryable operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_secs(2),
        }
    }
}

/// Run a command until it exits zero, retrying with doubling delay.
///
/// `build_cmd` is called once per attempt so each attempt gets a fresh
/// `Command`. When `target_dir` is given, any residue at that path is
/// removed before every attempt after the first, so a retried clone starts
/// against a clean target.
pub fn run_with_retry(
    policy: RetryPolicy,
    what: &str,
    target_dir: Option<&Path>,
    build_cmd: impl Fn() -> Command,
) -> Result<()> {
    if policy.max_attempts == 0 {
        bail!("retry policy for {} allows zero attempts", what);
    }

    let mut delay = policy.initial_delay;
    for attempt in 1..=policy.max_attempts {
        if attempt > 1 {
            if let Some(dir) = target_dir {
                if dir.exists() {
                    fs::remove_dir_all(dir).with_context(|| {
                        format!(
                            "removing partial output '{}' before retrying {}",
                            dir.display(),
                            what
                        )
                    })?;
                }
            }
        }

        let mut cmd = build_cmd();
        let status = cmd
            .status()
            .with_context(|| format!("spawning {} ({:?})", what, cmd))?;

        if status.success() {
            return Ok(());
        }

        if attempt < policy.max_attempts {
            println!(
                "[retry] {} failed with {} (attempt {}/{}); retrying in {}s",
                what,
                status,
                attempt,
                policy.max_attempts,
                delay.as_secs()
            );
            std::thread::sleep(delay);
            delay *= 2;
        } else {
            bail!(
                "{} failed after {} attempts (last command: {:?})",
                what,
                policy.max_attempts,
                cmd
            );
        }
    }

    unreachable!("loop either returns or bails on the last attempt")
}
