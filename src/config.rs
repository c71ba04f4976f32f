//! Harness configuration.
//!
//! Loaded from `cmdsandbox.yaml`, `cmdsandbox.yml` or `cmdsandbox.toml`,
//! discovered by searching upward from the test source file.

use crate::search::{Target, find_file};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML in {}: {source}", .path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid TOML in {}: {source}", .path.display())]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("unsupported file format: {0} (expected .yaml, .yml, or .toml)")]
    UnsupportedFormat(String),
}

/// Names searched for, in order.
pub const CONFIG_FILENAMES: [&str; 3] = ["cmdsandbox.yaml", "cmdsandbox.yml", "cmdsandbox.toml"];

/// Settings shared by every sandbox of a test suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Directory name that holds fixtures, searched upward from the test file.
    pub fixture_root: String,

    /// File that marks the project root; fixture search stops there.
    pub project_marker: String,

    /// Environment variables set for every command.
    pub env: BTreeMap<String, String>,

    /// Whether commands inherit the host environment.
    pub inherit_env: bool,

    /// Timeout in seconds for external commands. No timeout when unset.
    pub timeout: Option<u64>,

    /// Wrap commands in a launcher when its manifest is found.
    pub launcher: Option<Launcher>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            fixture_root: "fixtures".to_string(),
            project_marker: "Cargo.toml".to_string(),
            env: BTreeMap::new(),
            inherit_env: true,
            timeout: None,
            launcher: None,
        }
    }
}

/// A wrapper command selected by the presence of a manifest file.
///
/// ```yaml
/// launcher:
///   manifest: Gemfile
///   wrapper: [bundle, exec]
///   env_var: BUNDLE_GEMFILE
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Launcher {
    /// File name searched upward from the test source.
    pub manifest: String,

    /// Command prefix, e.g. `["bundle", "exec"]`.
    pub wrapper: Vec<String>,

    /// Variable set to the discovered manifest path.
    #[serde(default)]
    pub env_var: Option<String>,
}

impl Launcher {
    /// The Ruby bundler launcher.
    pub fn bundler() -> Self {
        Launcher {
            manifest: "Gemfile".to_string(),
            wrapper: vec!["bundle".to_string(), "exec".to_string()],
            env_var: Some("BUNDLE_GEMFILE".to_string()),
        }
    }

    /// Locate the manifest above `source`.
    pub fn find_manifest(&self, source: &Path) -> Option<PathBuf> {
        find_file(source, Target::name(&self.manifest), None)
    }
}

/// Load configuration from a file.
pub fn load_config(path: &Path) -> Result<HarnessConfig, LoadError> {
    load_file(path)
}

/// Deserialize a YAML or TOML file, dispatching on its extension.
///
/// An empty YAML document yields `T::default()`.
pub fn load_file<T>(path: &Path) -> Result<T, LoadError>
where
    T: DeserializeOwned + Default,
{
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let contents = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    match ext {
        "yaml" | "yml" => {
            if contents.trim().is_empty() {
                return Ok(T::default());
            }
            serde_yaml::from_str(&contents).map_err(|source| LoadError::Yaml {
                path: path.to_path_buf(),
                source,
            })
        }
        "toml" => toml::from_str(&contents).map_err(|source| LoadError::Toml {
            path: path.to_path_buf(),
            source,
        }),
        other => Err(LoadError::UnsupportedFormat(other.to_string())),
    }
}

/// Find the nearest configuration file above `source`.
pub fn find_config(source: &Path) -> Option<PathBuf> {
    let pred = |dir: &Path| {
        CONFIG_FILENAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
    };
    find_file(source, Target::Predicate(&pred), None)
}

/// Load the nearest configuration above `source`, or the defaults.
pub fn discover_config(source: &Path) -> Result<HarnessConfig, LoadError> {
    match find_config(source) {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading harness config");
            load_config(&path)
        }
        None => Ok(HarnessConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.fixture_root, "fixtures");
        assert_eq!(config.project_marker, "Cargo.toml");
        assert!(config.inherit_env);
        assert_eq!(config.timeout, None);
        assert_eq!(config.launcher, None);
    }

    #[test]
    fn load_valid_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cmdsandbox.yaml");
        std::fs::write(
            &path,
            r#"
fixture_root: data
timeout: 10
env:
  MY_VAR: my_value
launcher:
  manifest: Gemfile
  wrapper: [bundle, exec]
  env_var: BUNDLE_GEMFILE
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.fixture_root, "data");
        assert_eq!(config.project_marker, "Cargo.toml");
        assert_eq!(config.timeout, Some(10));
        assert_eq!(config.env.get("MY_VAR"), Some(&"my_value".to_string()));
        assert_eq!(config.launcher, Some(Launcher::bundler()));
    }

    #[test]
    fn load_valid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cmdsandbox.toml");
        std::fs::write(
            &path,
            r#"
inherit_env = false

[env]
LANG = "C"
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert!(!config.inherit_env);
        assert_eq!(config.env.get("LANG"), Some(&"C".to_string()));
    }

    #[test]
    fn empty_yaml_is_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cmdsandbox.yml");
        std::fs::write(&path, "\n").unwrap();
        assert_eq!(load_config(&path).unwrap(), HarnessConfig::default());
    }

    #[test]
    fn load_invalid_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "invalid: [yaml: {").unwrap();
        assert!(matches!(load_config(&path), Err(LoadError::Yaml { .. })));
    }

    #[test]
    fn unknown_field_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cmdsandbox.yaml");
        std::fs::write(&path, "fixture_dir: data\n").unwrap();
        assert!(matches!(load_config(&path), Err(LoadError::Yaml { .. })));
    }

    #[test]
    fn load_invalid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "invalid = [toml").unwrap();
        assert!(matches!(load_config(&path), Err(LoadError::Toml { .. })));
    }

    #[test]
    fn unsupported_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.txt");
        std::fs::write(&path, "").unwrap();
        assert!(matches!(
            load_config(&path),
            Err(LoadError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn discovered_from_nested_source() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("tests/deep")).unwrap();
        std::fs::write(root.join("cmdsandbox.toml"), "fixture_root = \"golden\"\n").unwrap();
        let source = root.join("tests/deep/case.rs");

        assert_eq!(find_config(&source), Some(root.join("cmdsandbox.toml")));
        assert_eq!(discover_config(&source).unwrap().fixture_root, "golden");
    }

    #[test]
    fn missing_config_is_default() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("case.rs");
        // Anything found above the temp dir is not ours; only check no error.
        assert!(discover_config(&source).is_ok());
    }

    #[test]
    fn launcher_manifest_found_upward() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("spec")).unwrap();
        std::fs::write(dir.path().join("Gemfile"), "").unwrap();
        let found = Launcher::bundler().find_manifest(&dir.path().join("spec/case_spec.rb"));
        assert_eq!(found, Some(dir.path().join("Gemfile")));
    }
}
