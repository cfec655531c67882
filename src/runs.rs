//! Run records: sortable run ids and per-run manifests under a runs directory.
//!
//! Layout: `<runs_dir>/<run_id>/run-manifest.json`.

use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::build::context::Package;

const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";
const RUN_ID_SALT_BITS: u32 = 32;
static RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

pub const STATUS_BUILDING: &str = "building";
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub status: String,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    #[serde(default)]
    pub block_device: String,
    #[serde(default)]
    pub provisioner: String,
    #[serde(default)]
    pub failed_step: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub package: Option<Package>,
}

/// Time-ordered id, unique across threads and processes of the same host.
pub fn generate_run_id() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before UNIX_EPOCH while generating run id")?
        .as_nanos();
    let pid_component = (std::process::id() as u128 & 0xFFFF) << 16;
    let seq_component = (RUN_ID_COUNTER.fetch_add(1, Ordering::Relaxed) as u128) & 0xFFFF;
    let entropy = (nanos << RUN_ID_SALT_BITS) | pid_component | seq_component;
    let id = base62_encode_u128(entropy);
    if id.len() > 22 {
        bail!("sortable run id overflow while generating run identifier")
    }
    Ok(id)
}

fn base62_encode_u128(mut value: u128) -> String {
    const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut bytes = Vec::new();
    while value > 0 {
        bytes.push(ALPHABET[(value % 62) as usize] as char);
        value /= 62;
    }
    bytes.iter().rev().collect()
}

/// `YYYYMMDDTHHMMSSZ`
pub fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

pub fn manifest_path(runs_dir: &Path, run_id: &str) -> PathBuf {
    runs_dir.join(run_id).join(RUN_MANIFEST_FILENAME)
}

pub fn write_run_metadata(runs_dir: &Path, metadata: &RunMetadata) -> Result<()> {
    let path = manifest_path(runs_dir, &metadata.run_id);
    write_json_atomic(&path, metadata)
        .with_context(|| format!("writing run metadata '{}'", path.display()))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(value).context("serializing run metadata")?;
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

pub fn load_runs_metadata(runs_dir: &Path) -> Result<Vec<RunMetadata>> {
    if !runs_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(runs_dir)
        .with_context(|| format!("reading runs directory '{}'", runs_dir.display()))?
    {
        let entry = entry
            .with_context(|| format!("iterating runs directory '{}'", runs_dir.display()))?;
        let run_dir = entry.path();
        let Some(run_name) = run_dir.file_name().and_then(|part| part.to_str()) else {
            continue;
        };
        if !run_dir.is_dir() || run_name.starts_with('.') {
            continue;
        }
        let path = run_dir.join(RUN_MANIFEST_FILENAME);
        if !path.is_file() {
            continue;
        }
        let bytes =
            fs::read(&path).with_context(|| format!("reading run metadata '{}'", path.display()))?;
        let parsed: RunMetadata = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing run metadata '{}'", path.display()))?;
        runs.push(parsed);
    }
    runs.sort_by_key(|run| Reverse(run_sort_key(run)));
    Ok(runs)
}

pub fn latest_successful_run_id(runs_dir: &Path) -> Result<Option<String>> {
    Ok(load_runs_metadata(runs_dir)?
        .into_iter()
        .find(|run| run.status == STATUS_SUCCESS)
        .map(|run| run.run_id))
}

/// Delete all but the `keep` most recent runs.
pub fn prune_old_runs(runs_dir: &Path, keep: usize) -> Result<()> {
    for run in load_runs_metadata(runs_dir)?.into_iter().skip(keep) {
        let path = runs_dir.join(&run.run_id);
        fs::remove_dir_all(&path)
            .with_context(|| format!("removing expired run directory '{}'", path.display()))?;
    }
    Ok(())
}

fn run_sort_key(run: &RunMetadata) -> (String, String) {
    let at = run
        .finished_at_utc
        .clone()
        .unwrap_or_else(|| run.created_at_utc.clone());
    (at, run.run_id.clone())
}
