//! Build configuration: per-plugin options and the TOML build file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::context::{BuildContext, Package};

/// Option name to value mapping for one plugin.
///
/// Reads never fail: absent keys fall back to a default chosen by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginConfig {
    options: BTreeMap<String, String>,
}

impl PluginConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Value for `key`. Empty strings count as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options
            .get(key)
            .map(|value| value.as_str())
            .filter(|value| !value.is_empty())
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        self.get(key).map(PathBuf::from)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PluginConfig {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            options: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Pipeline-level settings from the `[pipeline]` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub block_device: String,
    pub provisioner: String,
    pub lease_dir: Option<PathBuf>,
    pub runs_dir: Option<PathBuf>,
    pub keep_runs: Option<usize>,
}

/// A parsed build file.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub pipeline: PipelineSettings,
    pub package: Package,
    pub plugins: BTreeMap<String, PluginConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildToml {
    pipeline: PipelineToml,
    package: Option<PackageToml>,
    #[serde(default)]
    plugins: BTreeMap<String, toml::Table>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineToml {
    block_device: String,
    provisioner: String,
    lease_dir: Option<String>,
    runs_dir: Option<String>,
    keep_runs: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PackageToml {
    name: Option<String>,
    version: Option<String>,
    release: Option<String>,
    arg: Option<String>,
}

impl BuildConfig {
    /// Load a build file. Relative directories resolve against the file's parent.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading build config '{}'", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&raw, base_dir)
            .with_context(|| format!("parsing build config '{}'", path.display()))
    }

    pub fn parse(raw: &str, base_dir: &Path) -> Result<Self> {
        let parsed: BuildToml = toml::from_str(raw)?;

        let block_device = parsed.pipeline.block_device.trim().to_string();
        let provisioner = parsed.pipeline.provisioner.trim().to_string();
        if block_device.is_empty() {
            bail!("pipeline.block_device must not be empty");
        }
        if provisioner.is_empty() {
            bail!("pipeline.provisioner must not be empty");
        }

        let resolve = |value: Option<String>| value.map(|raw| base_dir.join(raw));
        let pipeline = PipelineSettings {
            block_device,
            provisioner,
            lease_dir: resolve(parsed.pipeline.lease_dir),
            runs_dir: resolve(parsed.pipeline.runs_dir),
            keep_runs: parsed.pipeline.keep_runs,
        };

        let package = parsed
            .package
            .map(|p| Package {
                name: p.name.unwrap_or_default(),
                version: p.version.unwrap_or_default(),
                release: p.release.unwrap_or_default(),
                arg: p.arg.unwrap_or_default(),
                attributes: BTreeMap::new(),
            })
            .unwrap_or_default();

        let mut plugins = BTreeMap::new();
        for (plugin, table) in parsed.plugins {
            let mut options = BTreeMap::new();
            for (key, value) in table {
                let value = scalar_to_string(&value).ok_or_else(|| {
                    anyhow::anyhow!(
                        "plugins.{}.{} must be a string, number or boolean",
                        plugin,
                        key
                    )
                })?;
                options.insert(key, value);
            }
            plugins.insert(plugin, PluginConfig { options });
        }

        Ok(Self {
            pipeline,
            package,
            plugins,
        })
    }

    pub fn into_context(self) -> (PipelineSettings, BuildContext) {
        let context = BuildContext {
            package: self.package,
            config: self.plugins,
        };
        (self.pipeline, context)
    }
}

fn scalar_to_string(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Datetime(d) => Some(d.to_string()),
        toml::Value::Array(_) | toml::Value::Table(_) => None,
    }
}
