//! Build configuration loading and merging.
//!
//! Settings live in line-oriented `KEY=value` files: a required base file
//! plus an optional override file. Later files win key-by-key; there is no
//! deep merge. The merged map is immutable for the rest of the run and is
//! passed by reference into every component. The external builder and the
//! generated stage scripts still receive the settings as environment
//! variables via [`BuildConfig::apply_env`].

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Command;

/// Merged, read-only build settings for one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct BuildConfig {
    values: BTreeMap<String, String>,
}

impl BuildConfig {
    /// Load the base settings file, then apply the override file on top.
    ///
    /// A missing base file is fatal (there is no safe default set). An
    /// override path that was requested but does not exist is also fatal:
    /// silently ignoring it would produce a misleadingly different build.
    pub fn load(base: &Path, override_path: Option<&Path>) -> Result<Self> {
        if !base.is_file() {
            bail!("missing base settings file '{}'", base.display());
        }
        let mut config = Self::default();
        config.apply_file(base)?;

        if let Some(path) = override_path {
            if !path.is_file() {
                bail!(
                    "requested settings override '{}' does not exist",
                    path.display()
                );
            }
            config.apply_file(path)?;
        }

        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading settings file '{}'", path.display()))?;

        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                bail!(
                    "invalid settings line {}:{}: expected KEY=value, got '{}'",
                    path.display(),
                    lineno + 1,
                    raw
                );
            };
            let key = key.trim();
            if key.is_empty() {
                bail!(
                    "invalid settings line {}:{}: empty key",
                    path.display(),
                    lineno + 1
                );
            }
            self.values
                .insert(key.to_string(), unquote(value.trim()).to_string());
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Get a key that must be present.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| anyhow::anyhow!("required setting '{}' is not configured", key))
    }

    /// Interpret a setting as a boolean. Accepts 1/0, true/false, yes/no.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        let Some(raw) = self.get(key) else {
            return Ok(default);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => bail!("setting '{}' has non-boolean value '{}'", key, other),
        }
    }

    pub fn get_u64(&self, key: &str, default: u64) -> Result<u64> {
        let Some(raw) = self.get(key) else {
            return Ok(default);
        };
        raw.trim()
            .parse::<u64>()
            .with_context(|| format!("setting '{}' has non-numeric value '{}'", key, raw))
    }

    /// Iterate all settings in sorted key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Export every setting as an environment variable on a subprocess.
    pub fn apply_env(&self, cmd: &mut Command) {
        for (key, value) in &self.values {
            cmd.env(key, value);
        }
    }

    // Well-known keys. Defaults mirror upstream pi-gen behavior.

    pub fn architecture(&self) -> &str {
        self.get_or("ARCHITECTURE", "armhf")
    }

    pub fn release(&self) -> &str {
        self.get_or("RELEASE", "bookworm")
    }

    pub fn img_name(&self) -> &str {
        self.get_or("IMG_NAME", "pi-forge")
    }

    pub fn desktop_enabled(&self) -> Result<bool> {
        self.get_bool("ENABLE_DESKTOP", true)
    }

    pub fn verify_passthrough(&self) -> Result<bool> {
        self.get_bool("VERIFY_PASSTHROUGH", true)
    }

    pub fn required_free_gb(&self) -> Result<u64> {
        self.get_u64("REQUIRED_FREE_GB", 16)
    }
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        if (first == b'"' || first == b'\'') && bytes[bytes.len() - 1] == first {
            return &value[1..value.len() - 1];
        }
    }
    value
}
