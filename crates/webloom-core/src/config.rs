use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use webloom_providers::{ProviderConfig, ProvidersConfig};
use webloom_sandbox::SandboxSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            port: default_port(),
        }
    }
}

fn default_hostname() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub server: ServerSettings,
}

impl AppConfig {
    pub fn providers_config(&self) -> ProvidersConfig {
        ProvidersConfig {
            providers: self.providers.clone(),
            default_provider: self.default_provider.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    cli: Value,
}

/// Layered configuration: the config file under the state dir, then
/// environment overrides, then CLI overrides, deep-merged in that order.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = read_json_file(&path).await.unwrap_or_else(|_| empty_object());

        let layers = ConfigLayers {
            file,
            env: env_layer(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        let store = Self {
            path,
            layers: Arc::new(RwLock::new(layers)),
        };
        store.save_file().await?;
        Ok(store)
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.get_effective_value().await;
        serde_json::from_value(merged).unwrap_or_default()
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.file);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn patch(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.file, &patch);
        }
        self.save_file().await?;
        Ok(self.get_effective_value().await)
    }

    async fn save_file(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.file.clone();
        let raw = serde_json::to_string_pretty(&snapshot)?;
        fs::write(&self.path, raw).await?;
        Ok(())
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}

fn deep_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                deep_merge(base_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (base_slot, patch_value) => {
            if !patch_value.is_null() {
                *base_slot = patch_value.clone();
            }
        }
    }
}

/// Environment overrides for the knobs an operator actually flips at deploy
/// time. Provider API keys are picked up by the provider registry itself.
fn env_layer() -> Value {
    let mut layer = empty_object();
    let mut set = |pointer: &[&str], value: Value| {
        let mut cursor = &mut layer;
        for key in &pointer[..pointer.len() - 1] {
            cursor = cursor
                .as_object_mut()
                .expect("layer is always an object")
                .entry((*key).to_string())
                .or_insert_with(empty_object);
        }
        if let Some(obj) = cursor.as_object_mut() {
            obj.insert(pointer[pointer.len() - 1].to_string(), value);
        }
    };

    if let Ok(value) = std::env::var("WEBLOOM_DEFAULT_PROVIDER") {
        set(&["default_provider"], json!(value));
    }
    if let Ok(value) = std::env::var("WEBLOOM_SANDBOX_ROOT") {
        set(&["sandbox", "root"], json!(value));
    }
    if let Ok(value) = std::env::var("WEBLOOM_SANDBOX_TEMPLATES") {
        set(&["sandbox", "templates_dir"], json!(value));
    }
    if let Some(value) = env_u64("WEBLOOM_STARTUP_PROBE_MS") {
        set(&["sandbox", "startup_probe_ms"], json!(value));
    }
    if let Some(value) = env_u64("WEBLOOM_PORT_MIN") {
        set(&["sandbox", "port_min"], json!(value));
    }
    if let Some(value) = env_u64("WEBLOOM_PORT_MAX") {
        set(&["sandbox", "port_max"], json!(value));
    }
    layer
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
