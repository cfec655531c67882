//! Fetching provisioning engines and payloads.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::Duration;

/// Downloads a URL to a local path.
pub trait Downloader: Send + Sync {
    fn download_file(&self, url: &str, destination: &Path) -> Result<()>;
}

/// HTTP(S) downloader; `file://` URLs and bare paths are copied locally.
pub struct HttpDownloader {
    client: reqwest::blocking::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .context("building HTTP client")?;
        Ok(Self { client })
    }
}

impl Downloader for HttpDownloader {
    fn download_file(&self, url: &str, destination: &Path) -> Result<()> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating download directory '{}'", parent.display()))?;
        }

        if !url.starts_with("http://") && !url.starts_with("https://") {
            let source = url.strip_prefix("file://").unwrap_or(url);
            fs::copy(source, destination).with_context(|| {
                format!("copying '{}' to '{}'", source, destination.display())
            })?;
            return Ok(());
        }

        tracing::info!(%url, destination = %destination.display(), "downloading");
        let mut response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("requesting '{}'", url))?;
        if !response.status().is_success() {
            bail!("downloading '{}' failed: HTTP {}", url, response.status());
        }

        let tmp = destination.with_extension("part");
        let mut file = File::create(&tmp)
            .with_context(|| format!("creating '{}'", tmp.display()))?;
        response
            .copy_to(&mut file)
            .with_context(|| format!("writing body of '{}'", url))?;
        fs::rename(&tmp, destination).with_context(|| {
            format!(
                "renaming '{}' to '{}'",
                tmp.display(),
                destination.display()
            )
        })?;
        Ok(())
    }
}

/// Verify a downloaded file against an expected lowercase hex sha256.
pub fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let actual = format!("{:x}", hasher.finalize());
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        bail!(
            "checksum mismatch for '{}': expected {}, got {}",
            path.display(),
            expected.trim(),
            actual
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_url_is_copied() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("payload.tar.gz");
        fs::write(&source, b"payload").unwrap();
        let dest = temp.path().join("out/nested/payload.tar.gz");

        let downloader = HttpDownloader::new().unwrap();
        downloader
            .download_file(&format!("file://{}", source.display()), &dest)
            .unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"payload");
    }

    #[test]
    fn test_missing_local_source_fails() {
        let temp = TempDir::new().unwrap();
        let downloader = HttpDownloader::new().unwrap();
        let result = downloader.download_file(
            temp.path().join("absent").to_str().unwrap(),
            &temp.path().join("dest"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_verify_sha256() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("blob");
        fs::write(&path, b"abc").unwrap();

        let good = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        assert!(verify_sha256(&path, good).is_ok());
        assert!(verify_sha256(&path, &good.to_uppercase()).is_ok());

        let err = verify_sha256(&path, &"0".repeat(64)).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }
}
