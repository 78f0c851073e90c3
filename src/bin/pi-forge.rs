use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use pi_forge::pipeline::{self, PipelineOptions};
use pi_forge::continuity;

fn usage() -> &'static str {
    "Usage:\n  \
     pi-forge [--docker] [--config <path>] [--clean] [--stage <name>]\n  \
     pi-forge resolve-rootfs <work_dir> <stage> <dest>\n\n\
     Options:\n  \
     --docker          delegate the build to a containerized builder\n  \
     --config <path>   settings override applied on top of ./config\n  \
     --clean           purge prior stage/work directories before starting\n  \
     --stage <name>    stop the pipeline after the named stage\n  \
     --help            show this message\n\n\
     `resolve-rootfs` is invoked by synthesized stage scripts; it reads the\n\
     stage order from STAGE_LIST in the builder environment."
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.first().map(String::as_str) == Some("resolve-rootfs") {
        return resolve_rootfs(&args[1..]);
    }

    let mut opts = PipelineOptions::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--docker" => opts.docker = true,
            "--clean" => opts.clean = true,
            "--config" => {
                let path = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config requires a path\n\n{}", usage()))?;
                opts.config_override = Some(PathBuf::from(path));
            }
            "--stage" => {
                let name = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--stage requires a name\n\n{}", usage()))?;
                opts.only_stage = Some(name.clone());
            }
            "--help" | "-h" => {
                println!("{}", usage());
                return Ok(());
            }
            other => bail!("unknown argument '{}'\n\n{}", other, usage()),
        }
    }

    let base_dir = std::env::current_dir().context("resolving current directory")?;
    pipeline::run(&base_dir, &opts)
}

/// Entry point for the synthesized host-side scripts.
///
/// The builder sources its config file into the environment before running
/// stage scripts, so the stage order and verification policy arrive as
/// STAGE_LIST and VERIFY_PASSTHROUGH.
fn resolve_rootfs(args: &[String]) -> Result<()> {
    let [work_dir, stage, dest] = args else {
        bail!("resolve-rootfs expects <work_dir> <stage> <dest>\n\n{}", usage());
    };

    let stage_list = std::env::var("STAGE_LIST")
        .context("STAGE_LIST is not set; resolve-rootfs must run inside the builder")?;
    let stage_order: Vec<String> = stage_list
        .split_whitespace()
        .map(|entry| {
            // Synthesized stages appear as absolute paths in the list;
            // stage work directories are named by basename.
            Path::new(entry)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| entry.to_string())
        })
        .collect();

    let verify = match std::env::var("VERIFY_PASSTHROUGH").ok().as_deref() {
        Some("0") | Some("false") | Some("no") | Some("off") => false,
        _ => true,
    };

    continuity::resolve_into(
        Path::new(work_dir),
        &stage_order,
        stage,
        Path::new(dest),
        verify,
    )?;
    Ok(())
}
