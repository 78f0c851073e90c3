//! Repository trust bootstrapping.
//!
//! pi-gen's stage0 apt-configuration step assumes the host keyring already
//! trusts the Raspberry Pi archive. On some architecture/release
//! combinations it does not, and the failure only surfaces much later as a
//! package-verification error. The fix is to prepend a remediation script
//! to the builder's own trust step: a descending ladder of recovery
//! attempts, each rung skipped when a cheaper rung already established
//! trust, ending in a narrowly-scoped escape hatch.
//!
//! The ladder is data (`TrustStep`), rendered into shell once, so each rung
//! exists in exactly one place. The original step body is appended verbatim
//! after the injected block: remediate, then do what pi-gen always did.

use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::config::BuildConfig;

const BEGIN_MARKER: &str = "# >>> pi-forge trust bootstrap >>>";
const END_MARKER: &str = "# <<< pi-forge trust bootstrap <<<";

/// Relative path of the apt trust step inside a pi-gen checkout.
pub const APT_TRUST_STEP: &str = "stage0/00-configure-apt/00-run.sh";

/// Keyservers tried in order for each key; first success wins per key.
pub const KEYSERVERS: &[&str] = &[
    "keyserver.ubuntu.com",
    "keys.openpgp.org",
    "pgp.mit.edu",
];

/// Signing-key fingerprints the Raspberry Pi archives are signed with.
pub const ARCHIVE_KEY_IDS: &[&str] = &[
    "82B129927FA3303E",
    "9165938D90FDDD2E",
];

/// One rung of the remediation ladder.
///
/// `already_ok` is a shell predicate; when it exits zero the rung is
/// skipped. `remedy` runs otherwise and is allowed to fail: the rendered
/// script guards every remedy so the next rung picks up, and the preserved
/// original step body stays the final arbiter of whether trust exists.
#[derive(Debug, Clone)]
pub struct TrustStep {
    pub label: &'static str,
    pub already_ok: String,
    pub remedy: String,
}

/// Build the five-rung remediation ladder for the configured release.
pub fn remediation_ladder(config: &BuildConfig) -> Vec<TrustStep> {
    let release = config.release();
    let keyring_deb_url = "http://archive.raspberrypi.com/debian/pool/main/r/\
                           raspberrypi-archive-keyring/raspberrypi-archive-keyring_2021.1.1+rpt1_all.deb";

    let fetch_keys = {
        let mut script = String::new();
        for key in ARCHIVE_KEY_IDS {
            script.push_str(&format!("for server in {}; do\n", KEYSERVERS.join(" ")));
            script.push_str(&format!(
                "    gpg --no-default-keyring --keyring \"$FORGE_KEYRING\" \
                 --keyserver \"$server\" --recv-keys {key} && break\ndone\n"
            ));
        }
        script
    };

    let export_keys = ARCHIVE_KEY_IDS
        .iter()
        .map(|key| {
            format!(
                "gpg --no-default-keyring --keyring \"$FORGE_KEYRING\" \
                 --export {key} > \"/etc/apt/trusted.gpg.d/pi-forge-{key}.gpg\"\n"
            )
        })
        .collect::<String>();

    vec![
        TrustStep {
            label: "install release keyring package",
            already_ok: "dpkg -s raspberrypi-archive-keyring >/dev/null 2>&1".to_string(),
            remedy: format!(
                "apt-get update >/dev/null 2>&1 || true\n\
                 apt-get install -y -t {release} raspberrypi-archive-keyring || true\n"
            ),
        },
        TrustStep {
            label: "install gpg from direct package source",
            // apt itself cannot be trusted yet, so the keyring deb comes
            // straight from the archive pool.
            already_ok: "command -v gpg >/dev/null 2>&1".to_string(),
            remedy: format!(
                "wget -q -O /tmp/keyring.deb {keyring_deb_url} && dpkg -i /tmp/keyring.deb || true\n\
                 apt-get install -y --allow-unauthenticated gnupg || true\n"
            ),
        },
        TrustStep {
            label: "fetch archive keys from keyservers",
            already_ok: keys_present_predicate(),
            remedy: format!("FORGE_KEYRING=/tmp/pi-forge-keyring.gpg\n{fetch_keys}"),
        },
        TrustStep {
            // A key recovered into the wrong location is invisible to apt;
            // placing it under trusted.gpg.d is its own explicit rung.
            label: "install recovered keys where apt scans",
            already_ok: keys_present_predicate(),
            remedy: format!(
                "FORGE_KEYRING=/tmp/pi-forge-keyring.gpg\n\
                 mkdir -p /etc/apt/trusted.gpg.d\n{export_keys}"
            ),
        },
        TrustStep {
            // Scoped to the archive entries being remediated: only the
            // raspberrypi source lines get [trusted=yes]. No global
            // signature-policy relaxation; every other source keeps full
            // verification.
            label: "mark archive entries trusted (last resort)",
            already_ok: "apt-get update >/dev/null 2>&1".to_string(),
            remedy: "sed -i 's/^deb \\(http[^ ]*raspberrypi[^ ]*\\)/deb [trusted=yes] \\1/' \
                     /etc/apt/sources.list /etc/apt/sources.list.d/*.list 2>/dev/null\n"
                .to_string(),
        },
    ]
}

fn keys_present_predicate() -> String {
    ARCHIVE_KEY_IDS
        .iter()
        .map(|key| format!("[ -s \"/etc/apt/trusted.gpg.d/pi-forge-{key}.gpg\" ]"))
        .collect::<Vec<_>>()
        .join(" && ")
}

/// Render the ladder as a short-circuiting shell block.
pub fn render_script(steps: &[TrustStep]) -> String {
    let mut script = String::new();
    script.push_str(BEGIN_MARKER);
    script.push('\n');
    script.push_str("# Generated; regenerated on every run. Do not edit between markers.\n");
    for step in steps {
        script.push_str(&format!("echo \"[trust] {}\"\n", step.label));
        script.push_str(&format!("if {}; then\n", step.already_ok));
        script.push_str(&format!(
            "    echo \"[trust] {}: already satisfied, skipping\"\n",
            step.label
        ));
        // Remedies run inside a guarded subshell. The host script runs
        // under `set -e`; an unguarded failing remedy would abort the
        // whole step before the remaining rungs ever got their turn.
        script.push_str("elif ! (\n");
        for line in step.remedy.lines() {
            script.push_str("    ");
            script.push_str(line);
            script.push('\n');
        }
        script.push_str(&format!(
            "); then\n    echo \"[trust] {}: remediation failed, trying next rung\"\nfi\n",
            step.label
        ));
    }
    script.push_str(END_MARKER);
    script.push('\n');
    script
}

/// Inject the remediation ladder ahead of pi-gen's apt trust step.
///
/// The original step body is preserved verbatim after the injected block.
/// Re-running replaces any previously injected block instead of stacking a
/// second copy, so repeated pipeline invocations converge.
pub fn inject(pigen_dir: &Path, config: &BuildConfig) -> Result<PathBuf> {
    let script_path = pigen_dir.join(APT_TRUST_STEP);
    if !script_path.is_file() {
        bail!(
            "pi-gen apt trust step not found at '{}'; checkout layout changed?",
            script_path.display()
        );
    }

    let original = fs::read_to_string(&script_path)
        .with_context(|| format!("reading trust step '{}'", script_path.display()))?;
    let body = strip_injected_block(&original)?;

    let remediation = render_script(&remediation_ladder(config));

    // Keep the shebang first if the original had one.
    let patched = match body.strip_prefix("#!") {
        Some(rest) => {
            let (shebang, tail) = rest.split_once('\n').unwrap_or((rest, ""));
            format!("#!{shebang}\n{remediation}{tail}")
        }
        None => format!("{remediation}{body}"),
    };

    fs::write(&script_path, patched)
        .with_context(|| format!("writing patched trust step '{}'", script_path.display()))?;
    let mut perms = fs::metadata(&script_path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script_path, perms)?;

    println!(
        "[trust] remediation injected ahead of {}",
        APT_TRUST_STEP
    );
    Ok(script_path)
}

/// Remove a previously injected block, returning the untouched body.
fn strip_injected_block(content: &str) -> Result<String> {
    let Some(begin) = content.find(BEGIN_MARKER) else {
        return Ok(content.to_string());
    };
    let Some(end) = content.find(END_MARKER) else {
        bail!("trust step has a begin marker but no end marker; refusing to patch");
    };
    let after = end + END_MARKER.len();
    let tail = content[after..].strip_prefix('\n').unwrap_or(&content[after..]);
    Ok(format!("{}{}", &content[..begin], tail))
}
