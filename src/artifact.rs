//! Final artifact collection: relocate images, checksum, record.
//!
//! After a successful builder run the images in pi-gen's deploy directory
//! move into the configured deploy directory, each with a SHA-256 sidecar,
//! an optional zstd-compressed copy, and a machine-readable build record.
//! Artifacts are immutable once written.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::BuildConfig;

/// File extensions pi-gen may deploy, depending on its own compression
/// settings.
const IMAGE_EXTENSIONS: &[&str] = &["img", "xz", "zip"];

/// Record of one successful build, serialized next to the image.
#[derive(Debug, Clone, Serialize)]
pub struct BuildRecord {
    pub img_name: String,
    pub architecture: String,
    pub release: String,
    pub builder_branch: String,
    pub stage_list: Vec<String>,
    pub images: Vec<ImageRecord>,
    pub started_at_utc: String,
    pub finished_at_utc: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageRecord {
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: String,
}

/// RFC 3339 UTC timestamp for build records.
pub fn now_utc() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("formatting current time")
}

/// Streaming SHA-256 of a file; returns (hex digest, size in bytes).
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let file =
        File::open(path).with_context(|| format!("opening '{}' for hashing", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("reading '{}' for hashing", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

/// Atomically move a file by renaming, with fallback to copy+delete.
pub fn atomic_move(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Different filesystem, fall back to copy+delete.
            fs::copy(src, dst)
                .with_context(|| format!("copying {} to {}", src.display(), dst.display()))?;
            fs::remove_file(src)
                .with_context(|| format!("removing {}", src.display()))?;
            Ok(())
        }
    }
}

/// Write `<image>.sha256` in `sha256sum -c` compatible format.
pub fn write_checksum_sidecar(image: &Path) -> Result<(PathBuf, ImageRecord)> {
    let (digest, size) = sha256_file(image)?;
    let filename = image
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("image path '{}' has no filename", image.display()))?
        .to_string();

    let sidecar = image.with_extension(format!(
        "{}.sha256",
        image.extension().and_then(|e| e.to_str()).unwrap_or("img")
    ));
    fs::write(&sidecar, format!("{}  {}\n", digest, filename))
        .with_context(|| format!("writing checksum sidecar '{}'", sidecar.display()))?;

    Ok((
        sidecar,
        ImageRecord {
            filename,
            size_bytes: size,
            sha256: digest,
        },
    ))
}

/// Write a zstd-compressed copy next to the image (`<image>.zst`).
pub fn compress_image(image: &Path) -> Result<PathBuf> {
    let target = PathBuf::from(format!("{}.zst", image.display()));
    let input =
        File::open(image).with_context(|| format!("opening '{}'", image.display()))?;
    let output = File::create(&target)
        .with_context(|| format!("creating compressed copy '{}'", target.display()))?;
    zstd::stream::copy_encode(BufReader::new(input), output, 0).with_context(|| {
        format!(
            "compressing '{}' to '{}'",
            image.display(),
            target.display()
        )
    })?;
    Ok(target)
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Collect the builder's deployed images into `deploy_dir`.
///
/// Relocates every image file, writes checksums and the build record, and
/// optionally a compressed copy (`COMPRESS_IMAGE`). An empty deploy
/// directory after a "successful" builder run is fatal: the run produced
/// nothing exportable.
pub fn collect_artifacts(
    builder_deploy: &Path,
    deploy_dir: &Path,
    config: &BuildConfig,
    builder_branch: &str,
    stage_list: &[String],
    started_at_utc: &str,
) -> Result<BuildRecord> {
    if !builder_deploy.is_dir() {
        bail!(
            "builder reported success but deploy directory '{}' does not exist",
            builder_deploy.display()
        );
    }
    fs::create_dir_all(deploy_dir)
        .with_context(|| format!("creating deploy directory '{}'", deploy_dir.display()))?;

    let mut produced: Vec<PathBuf> = fs::read_dir(builder_deploy)
        .with_context(|| format!("reading deploy directory '{}'", builder_deploy.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_image_file(path))
        .collect();
    produced.sort();

    if produced.is_empty() {
        bail!(
            "builder reported success but no image files were found under '{}'",
            builder_deploy.display()
        );
    }

    let compress = config.get_bool("COMPRESS_IMAGE", false)?;
    let mut images = Vec::new();
    for src in &produced {
        let dst = deploy_dir.join(src.file_name().unwrap_or_default());
        atomic_move(src, &dst)?;
        let (_, record) = write_checksum_sidecar(&dst)?;
        println!(
            "[artifact] {} ({} MB, sha256 {})",
            record.filename,
            record.size_bytes / 1024 / 1024,
            &record.sha256[..16]
        );
        if compress {
            let compressed = compress_image(&dst)?;
            println!("[artifact] compressed copy at {}", compressed.display());
        }
        images.push(record);
    }

    let record = BuildRecord {
        img_name: config.img_name().to_string(),
        architecture: config.architecture().to_string(),
        release: config.release().to_string(),
        builder_branch: builder_branch.to_string(),
        stage_list: stage_list.to_vec(),
        images,
        started_at_utc: started_at_utc.to_string(),
        finished_at_utc: now_utc()?,
    };

    let record_path = deploy_dir.join("build-record.json");
    let json = serde_json::to_string_pretty(&record).context("serializing build record")?;
    fs::write(&record_path, json)
        .with_context(|| format!("writing build record '{}'", record_path.display()))?;
    println!("[artifact] build record at {}", record_path.display());

    Ok(record)
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
    fn sha256_known_vector() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("file");
        fs::write(&path, b"abc").unwrap();
        let (digest, size) = sha256_file(&path).unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(size, 3);
    }

    #[test]
    fn checksum_sidecar_format() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("demo.img");
        fs::write(&image, b"image-bytes").unwrap();

        let (sidecar, record) = write_checksum_sidecar(&image).unwrap();
        assert!(sidecar.ends_with("demo.img.sha256"));
        let content = fs::read_to_string(&sidecar).unwrap();
        assert_eq!(content, format!("{}  demo.img\n", record.sha256));
    }

    #[test]
    fn collect_moves_checksums_and_records() {
        let temp = TempDir::new().unwrap();
        let builder_deploy = temp.path().join("pi-gen/deploy");
        let deploy = temp.path().join("deploy");
        fs::create_dir_all(&builder_deploy).unwrap();
        fs::write(builder_deploy.join("2026-01-01-demo.img"), b"fake image").unwrap();
        fs::write(builder_deploy.join("build.log.txt"), b"not an image").unwrap();

        let config = config_with("IMG_NAME=demo\nARCHITECTURE=arm64\n");
        let record = collect_artifacts(
            &builder_deploy,
            &deploy,
            &config,
            "arm64",
            &["stage0".to_string()],
            "2026-01-01T00:00:00Z",
        )
        .unwrap();

        assert_eq!(record.images.len(), 1);
        assert_eq!(record.images[0].filename, "2026-01-01-demo.img");
        assert!(deploy.join("2026-01-01-demo.img").is_file());
        assert!(deploy.join("2026-01-01-demo.img.sha256").is_file());
        assert!(deploy.join("build-record.json").is_file());
        // Consumed from the builder's deploy dir.
        assert!(!builder_deploy.join("2026-01-01-demo.img").exists());

        let json = fs::read_to_string(deploy.join("build-record.json")).unwrap();
        assert!(json.contains("\"builder_branch\": \"arm64\""));
    }

    #[test]
    fn compressed_copy_when_configured() {
        let temp = TempDir::new().unwrap();
        let builder_deploy = temp.path().join("pi-gen/deploy");
        let deploy = temp.path().join("deploy");
        fs::create_dir_all(&builder_deploy).unwrap();
        fs::write(builder_deploy.join("demo.img"), vec![7u8; 4096]).unwrap();

        let config = config_with("IMG_NAME=demo\nCOMPRESS_IMAGE=1\n");
        collect_artifacts(
            &builder_deploy,
            &deploy,
            &config,
            "master",
            &[],
            "2026-01-01T00:00:00Z",
        )
        .unwrap();

        let compressed = deploy.join("demo.img.zst");
        assert!(compressed.is_file());
        // Repetitive input must actually compress.
        assert!(fs::metadata(&compressed).unwrap().len() < 4096);
    }

    #[test]
    fn empty_deploy_is_fatal() {
        let temp = TempDir::new().unwrap();
        let builder_deploy = temp.path().join("pi-gen/deploy");
        fs::create_dir_all(&builder_deploy).unwrap();
        let config = config_with("IMG_NAME=demo\n");

        let result = collect_artifacts(
            &builder_deploy,
            &temp.path().join("deploy"),
            &config,
            "master",
            &[],
            "2026-01-01T00:00:00Z",
        );
        assert!(result.is_err());
    }
}
