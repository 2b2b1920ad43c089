//! Configuration loading and the alias index.
//!
//! Treated by the specification as an "external Config collaborator"; this
//! module is where that collaborator actually lives in this binary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::errors::{OrchestratorError, Result};

/// The four recognized model modes, each backed by one interface plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum Mode {
    Chat,
    Base,
    Embedding,
    Reranker,
}

impl Mode {
    pub fn endpoint(&self) -> &'static str {
        match self {
            Mode::Chat => "v1/chat/completions",
            Mode::Base => "v1/completions",
            Mode::Embedding => "v1/embeddings",
            Mode::Reranker => "v1/rerank",
        }
    }
}

/// One device/script variant of a model, keyed by an operator-chosen name
/// (e.g. "gpu", "cpu") in the raw YAML. Declaration order is significant.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigVariant {
    #[serde(default)]
    pub required_devices: Vec<String>,
    pub script_path: String,
    pub memory_mb: HashMap<String, u64>,
}

/// Raw per-model YAML entry. `aliases`, `mode`, `port`, `auto_start` are
/// reserved keys; every other key whose value is a mapping is a variant.
#[derive(Debug, Clone, Deserialize)]
struct RawModelEntry {
    aliases: Vec<String>,
    mode: Mode,
    port: u16,
    #[serde(default)]
    auto_start: bool,
    #[serde(flatten)]
    variants: IndexMap<String, serde_yaml::Value>,
}

/// A fully resolved, static model configuration.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub aliases: Vec<String>,
    pub mode: Mode,
    pub port: u16,
    pub auto_start: bool,
    pub variants: Vec<(String, ConfigVariant)>,
}

impl ModelConfig {
    pub fn primary_name(&self) -> &str {
        &self.aliases[0]
    }
}

/// The variant selected for a particular spawn, with provenance.
#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    pub config_source: String,
    pub script_path: String,
    pub required_devices: Vec<String>,
    pub memory_mb: HashMap<String, u64>,
    pub port: u16,
    pub mode: Mode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgramConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub alive_time: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub disable_gpu_monitoring: bool,
    #[serde(default = "default_token_tracker_modes")]
    pub token_tracker: Vec<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_token_tracker_modes() -> Vec<String> {
    vec!["Chat", "Base", "Embedding", "Reranker"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    program: ProgramConfig,
    #[serde(rename = "Local-Models", default)]
    local_models: IndexMap<String, RawModelEntry>,
}

struct Loaded {
    program: ProgramConfig,
    models: IndexMap<String, ModelConfig>,
    alias_to_primary: HashMap<String, String>,
}

/// Owns the parsed config file, the alias index, and adaptive-config
/// selection. All mutation happens under one lock so `reload_config` is
/// atomic from the point of view of readers.
pub struct ConfigManager {
    config_path: PathBuf,
    inner: RwLock<Loaded>,
}

impl ConfigManager {
    pub fn load(config_path: impl AsRef<Path>) -> Result<Self> {
        let config_path = config_path.as_ref().to_path_buf();
        let loaded = Self::load_from_disk(&config_path)?;
        Ok(Self { config_path, inner: RwLock::new(loaded) })
    }

    fn load_from_disk(path: &Path) -> Result<Loaded> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| OrchestratorError::Config(format!("reading {}: {e}", path.display())))?;
        let raw: RawConfig = serde_yaml::from_str(&text)
            .map_err(|e| OrchestratorError::Config(format!("parsing {}: {e}", path.display())))?;

        let mut models = IndexMap::new();
        let mut alias_to_primary = HashMap::new();

        for (key, entry) in raw.local_models {
            if entry.aliases.is_empty() {
                return Err(OrchestratorError::Config(format!(
                    "model '{key}' has an empty 'aliases' list"
                )));
            }
            let primary = entry.aliases[0].clone();
            for alias in &entry.aliases {
                if alias_to_primary.contains_key(alias) {
                    return Err(OrchestratorError::Config(format!(
                        "duplicate alias '{alias}' (declared again by model '{key}')"
                    )));
                }
                alias_to_primary.insert(alias.clone(), primary.clone());
            }

            let mut variants = Vec::new();
            for (variant_name, value) in entry.variants {
                if !value.is_mapping() {
                    continue;
                }
                let variant: ConfigVariant = serde_yaml::from_value(value).map_err(|e| {
                    OrchestratorError::Config(format!(
                        "model '{key}' variant '{variant_name}': {e}"
                    ))
                })?;
                variants.push((variant_name, variant));
            }
            if variants.is_empty() {
                return Err(OrchestratorError::Config(format!(
                    "model '{key}' has no usable device/script variant"
                )));
            }

            models.insert(
                primary.clone(),
                ModelConfig {
                    aliases: entry.aliases,
                    mode: entry.mode,
                    port: entry.port,
                    auto_start: entry.auto_start,
                    variants,
                },
            );
        }

        Ok(Loaded { program: raw.program, models, alias_to_primary })
    }

    pub fn reload(&self) -> Result<()> {
        let loaded = Self::load_from_disk(&self.config_path)?;
        let mut guard = self.inner.write().unwrap();
        *guard = loaded;
        Ok(())
    }

    pub fn program(&self) -> ProgramConfig {
        self.inner.read().unwrap().program.clone()
    }

    pub fn resolve_primary_name(&self, alias: &str) -> Option<String> {
        self.inner.read().unwrap().alias_to_primary.get(alias).cloned()
    }

    pub fn model_config(&self, primary_name: &str) -> Option<ModelConfig> {
        self.inner.read().unwrap().models.get(primary_name).cloned()
    }

    pub fn all_model_configs(&self) -> Vec<ModelConfig> {
        self.inner.read().unwrap().models.values().cloned().collect()
    }

    pub fn primary_names(&self) -> Vec<String> {
        self.inner.read().unwrap().models.keys().cloned().collect()
    }

    /// Picks the first declared variant whose `required_devices` are all
    /// online. Returns `None` if no variant qualifies, or if the model is
    /// unknown. When `disable_gpu_monitoring` is set by the caller, pass an
    /// `online_devices` set that already contains every device name the
    /// config could reference — admission is then unconditional.
    pub fn adaptive_config(
        &self,
        primary_name: &str,
        online_devices: &std::collections::HashSet<String>,
    ) -> Option<AdaptiveConfig> {
        let guard = self.inner.read().unwrap();
        let model = guard.models.get(primary_name)?;
        for (name, variant) in &model.variants {
            if variant.required_devices.iter().all(|d| online_devices.contains(d)) {
                return Some(AdaptiveConfig {
                    config_source: name.clone(),
                    script_path: normalize_path(&variant.script_path),
                    required_devices: variant.required_devices.clone(),
                    memory_mb: variant.memory_mb.clone(),
                    port: model.port,
                    mode: model.mode,
                });
            }
        }
        None
    }
}

#[cfg(unix)]
fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

#[cfg(not(unix))]
fn normalize_path(path: &str) -> String {
    PathBuf::from(path).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    const SAMPLE: &str = r#"
program:
  host: "0.0.0.0"
  port: 8080
  alive_time: 30

Local-Models:
  chat-a:
    aliases: ["chat-a", "chat-a-alt"]
    mode: Chat
    port: 9001
    auto_start: false
    gpu:
      required_devices: ["gpu0"]
      script_path: "./start_gpu.sh"
      memory_mb: { gpu0: 8000 }
    cpu:
      required_devices: []
      script_path: "./start_cpu.sh"
      memory_mb: { cpu: 4000 }
"#;

    #[test]
    fn resolves_aliases_to_primary_name() {
        let (_dir, path) = write_config(SAMPLE);
        let mgr = ConfigManager::load(&path).unwrap();
        assert_eq!(mgr.resolve_primary_name("chat-a-alt").as_deref(), Some("chat-a"));
        assert_eq!(mgr.resolve_primary_name("nope"), None);
    }

    #[test]
    fn adaptive_config_prefers_declared_order() {
        let (_dir, path) = write_config(SAMPLE);
        let mgr = ConfigManager::load(&path).unwrap();

        let mut online = std::collections::HashSet::new();
        online.insert("gpu0".to_string());
        online.insert("cpu".to_string());
        let chosen = mgr.adaptive_config("chat-a", &online).unwrap();
        assert_eq!(chosen.config_source, "gpu");

        let cpu_only: std::collections::HashSet<String> =
            std::collections::HashSet::from(["cpu".to_string()]);
        let chosen = mgr.adaptive_config("chat-a", &cpu_only).unwrap();
        assert_eq!(chosen.config_source, "cpu");
    }

    #[test]
    fn duplicate_alias_is_fatal() {
        let dup = SAMPLE.to_string() + "\n  chat-b:\n    aliases: [\"chat-a\"]\n    mode: Chat\n    port: 9002\n    cpu:\n      required_devices: []\n      script_path: \"./x.sh\"\n      memory_mb: {}\n";
        let (_dir, path) = write_config(&dup);
        assert!(ConfigManager::load(&path).is_err());
    }
}
