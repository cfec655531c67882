//! Build context threaded through one pipeline run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::config::PluginConfig;

/// Metadata describing the artifact a run produces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub release: String,
    /// Opaque provisioning argument (e.g. a chef run-list).
    #[serde(default)]
    pub arg: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// End-to-end state for one image build.
///
/// Owned by the caller of the pipeline and lent mutably for a single run.
/// Provisioners only write to it while storing package metadata.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    pub package: Package,
    pub config: BTreeMap<String, PluginConfig>,
}

impl BuildContext {
    pub fn new(package: Package) -> Self {
        Self {
            package,
            config: BTreeMap::new(),
        }
    }

    /// Attach options for the plugin registered under `plugin`.
    pub fn with_plugin_config(mut self, plugin: impl Into<String>, config: PluginConfig) -> Self {
        self.config.insert(plugin.into(), config);
        self
    }

    /// Options for `plugin`, or an empty set when none were supplied.
    pub fn plugin_config(&self, plugin: &str) -> PluginConfig {
        self.config.get(plugin).cloned().unwrap_or_default()
    }

    /// Record name, version and release of the resulting artifact.
    ///
    /// The three values are mirrored into `attributes` so consumers that only
    /// read the attribute map see them too.
    pub fn set_package_metadata(&mut self, name: String, version: String, release: String) {
        let attributes = &mut self.package.attributes;
        attributes.insert("name".into(), serde_json::Value::String(name.clone()));
        attributes.insert("version".into(), serde_json::Value::String(version.clone()));
        attributes.insert("release".into(), serde_json::Value::String(release.clone()));
        self.package.name = name;
        self.package.version = version;
        self.package.release = release;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_config_missing_is_empty() {
        let context = BuildContext::default();
        assert!(context.plugin_config("chef").get("payload_url").is_none());
    }

    #[test]
    fn test_set_package_metadata_mirrors_attributes() {
        let mut context = BuildContext::default();
        context.set_package_metadata("app".into(), "1.0".into(), "1".into());

        assert_eq!(context.package.name, "app");
        assert_eq!(context.package.version, "1.0");
        assert_eq!(context.package.release, "1");
        assert_eq!(context.package.attributes["version"], "1.0");
    }
}
