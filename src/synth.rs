//! Custom stage synthesis.
//!
//! pi-gen consumes a directory per stage, each holding numbered step
//! subdirectories with a host-side `00-run.sh`, an optional chroot-side
//! `01-run-chroot.sh`, and a `files/` payload directory. The synthesizer
//! turns the build configuration into that tree. Stages are regenerated
//! from scratch on every run; there is no incremental stage state.
//!
//! Auxiliary files a chroot script needs are physically written into the
//! step's `files/` directory: the chroot execution environment cannot see
//! this process's filesystem.

use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::config::BuildConfig;

/// Stock pi-gen stages that always run before the synthesized ones.
pub const STOCK_STAGES: &[&str] = &["stage0", "stage1", "stage2"];

/// Marker file pi-gen looks for in the stage whose output becomes the image.
pub const EXPORT_MARKER: &str = "EXPORT_IMAGE";

/// One ordered sub-step of a stage.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    /// Runs in the builder's execution context (copies files, resolves
    /// the input rootfs).
    pub host_script: String,
    /// Runs with the target filesystem root-swapped.
    pub chroot_script: Option<String>,
    /// `(filename, contents)` payloads written into the step's `files/`.
    pub files: Vec<(String, String)>,
}

impl Step {
    fn new(name: &str, host_script: String) -> Self {
        Self {
            name: name.to_string(),
            host_script,
            chroot_script: None,
            files: Vec::new(),
        }
    }
}

/// A synthesized stage: ordered steps plus the export flag.
#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub steps: Vec<Step>,
    pub export: bool,
}

impl Stage {
    /// Full pipeline order: stock stages followed by the synthesized ones.
    pub fn pipeline_order(stages: &[Stage]) -> Vec<String> {
        STOCK_STAGES
            .iter()
            .map(|s| s.to_string())
            .chain(stages.iter().map(|s| s.name.clone()))
            .collect()
    }
}

/// Plan the custom stages for this configuration.
///
/// The desktop stage is included when `ENABLE_DESKTOP` is truthy. When it
/// is skipped, a pass-through placeholder takes its position so the
/// snapshot chain has no hole: downstream continuity resolution depends on
/// some snapshot existing at every position.
pub fn plan_stages(config: &BuildConfig) -> Result<Vec<Stage>> {
    let desktop = if config.desktop_enabled()? {
        desktop_stage(config)
    } else {
        println!("[synth] desktop disabled; emitting pass-through placeholder stage");
        placeholder_stage("stage-desktop", "desktop disabled in configuration")
    };

    let mut app = app_stage(config);
    app.export = true;

    Ok(vec![desktop, app])
}

fn continuity_step(stage_name: &str) -> Step {
    // The resolver runs inside this stage, so the script re-executes the
    // orchestrator binary exported by the pipeline driver. Stage order and
    // verification policy travel through the builder's own environment.
    Step::new(
        "resolve-rootfs",
        format!(
            "#!/bin/bash -e\n\
             \"${{PI_FORGE_BIN:?pi-forge binary not exported into builder env}}\" \
             resolve-rootfs \"${{WORK_DIR}}\" {stage_name} \"${{ROOTFS_DIR}}\"\n"
        ),
    )
}

fn app_stage(config: &BuildConfig) -> Stage {
    let hostname = config.get_or("TARGET_HOSTNAME", "raspberrypi").to_string();
    let packages = config.get_or("EXTRA_PACKAGES", "").to_string();

    let mut install = Step::new(
        "install-packages",
        "#!/bin/bash -e\ninstall -m 644 files/zz-pi-forge.conf \"${ROOTFS_DIR}/etc/apt/apt.conf.d/\"\n"
            .to_string(),
    );
    install.chroot_script = Some(format!(
        "#!/bin/bash -e\n\
         apt-get update\n\
         if [ -n \"{packages}\" ]; then\n\
             apt-get install -y --no-install-recommends {packages}\n\
         fi\n"
    ));
    install.files.push((
        "zz-pi-forge.conf".to_string(),
        "APT::Install-Recommends \"false\";\n".to_string(),
    ));

    let mut configure = Step::new(
        "configure-system",
        "#!/bin/bash -e\n\
         install -m 755 files/firstboot.sh \"${ROOTFS_DIR}/usr/local/sbin/pi-forge-firstboot\"\n"
            .to_string(),
    );
    configure.chroot_script = Some(format!(
        "#!/bin/bash -e\n\
         echo {hostname} > /etc/hostname\n\
         sed -i \"s/127.0.1.1.*/127.0.1.1\\t{hostname}/\" /etc/hosts\n"
    ));
    configure.files.push((
        "firstboot.sh".to_string(),
        "#!/bin/sh\n# Expands the root partition on first boot.\nraspi-config --expand-rootfs\n"
            .to_string(),
    ));

    Stage {
        name: "stage-app".to_string(),
        steps: vec![continuity_step("stage-app"), install, configure],
        export: false,
    }
}

fn desktop_stage(config: &BuildConfig) -> Stage {
    let packages = config.get_or(
        "DESKTOP_PACKAGES",
        "xserver-xorg xinit lightdm lxde-core",
    );

    let mut install = Step::new("install-desktop", "#!/bin/bash -e\n".to_string());
    install.chroot_script = Some(format!(
        "#!/bin/bash -e\n\
         apt-get update\n\
         apt-get install -y --no-install-recommends {packages}\n"
    ));

    // Optional tweak: panel autostart only applies when the panel is
    // present; on a lite rootfs this logs and moves on rather than failing.
    let mut tweak = Step::new(
        "desktop-tweaks",
        "#!/bin/bash -e\n\
         install -m 644 -D files/autostart \"${ROOTFS_DIR}/etc/xdg/lxsession/LXDE/autostart\"\n"
            .to_string(),
    );
    tweak.chroot_script = Some(
        "#!/bin/bash -e\n\
         if ! command -v lxpanel >/dev/null 2>&1; then\n\
             echo \"[desktop-tweaks] lxpanel absent on this rootfs; skipping panel setup\"\n\
             exit 0\n\
         fi\n\
         lxpanel --profile LXDE --command restart || true\n"
            .to_string(),
    );
    tweak.files.push((
        "autostart".to_string(),
        "@lxpanel --profile LXDE\n@pcmanfm --desktop --profile LXDE\n".to_string(),
    ));

    Stage {
        name: "stage-desktop".to_string(),
        steps: vec![continuity_step("stage-desktop"), install, tweak],
        export: false,
    }
}

/// A stage that only materializes its input snapshot and explains itself.
fn placeholder_stage(name: &str, reason: &str) -> Stage {
    let mut step = continuity_step(name);
    step.host_script.push_str(&format!(
        "echo \"[{name}] placeholder stage: {reason}; snapshot passed through\"\n"
    ));
    Stage {
        name: name.to_string(),
        steps: vec![step],
        export: false,
    }
}

/// Write the synthesized stages under `root`, one directory per stage.
///
/// Each stage directory is deleted and rebuilt. Exactly one stage must be
/// flagged as the export source; anything else is a planning bug.
pub fn write_stages(root: &Path, stages: &[Stage]) -> Result<()> {
    let export_count = stages.iter().filter(|s| s.export).count();
    if export_count != 1 {
        bail!(
            "exactly one stage must be marked as the image export source, found {}",
            export_count
        );
    }

    for stage in stages {
        let stage_dir = root.join(&stage.name);
        if stage_dir.exists() {
            fs::remove_dir_all(&stage_dir).with_context(|| {
                format!("removing previous stage directory '{}'", stage_dir.display())
            })?;
        }
        fs::create_dir_all(&stage_dir)
            .with_context(|| format!("creating stage directory '{}'", stage_dir.display()))?;

        for (index, step) in stage.steps.iter().enumerate() {
            let step_dir = stage_dir.join(format!("{:02}-{}", index, step.name));
            fs::create_dir_all(&step_dir)
                .with_context(|| format!("creating step directory '{}'", step_dir.display()))?;

            write_script(&step_dir.join("00-run.sh"), &step.host_script)?;
            if let Some(chroot) = &step.chroot_script {
                write_script(&step_dir.join("01-run-chroot.sh"), chroot)?;
            }
            if !step.files.is_empty() {
                let files_dir = step_dir.join("files");
                fs::create_dir_all(&files_dir).with_context(|| {
                    format!("creating step files directory '{}'", files_dir.display())
                })?;
                for (filename, contents) in &step.files {
                    fs::write(files_dir.join(filename), contents).with_context(|| {
                        format!("writing step file '{}/{}'", files_dir.display(), filename)
                    })?;
                }
            }
        }

        if stage.export {
            fs::write(stage_dir.join(EXPORT_MARKER), "")
                .with_context(|| format!("writing export marker in '{}'", stage_dir.display()))?;
        }
        println!(
            "[synth] wrote {} ({} steps{})",
            stage.name,
            stage.steps.len(),
            if stage.export { ", export source" } else { "" }
        );
    }

    Ok(())
}

fn write_script(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents)
        .with_context(|| format!("writing script '{}'", path.display()))?;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)
        .with_context(|| format!("marking script '{}' executable", path.display()))?;
    Ok(())
}
