use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Sandbox tunables. The startup probe delay is a liveness heuristic for
/// catching obvious launch failures, not a correctness boundary, and stays
/// configurable for that reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,
    #[serde(default = "default_port_min")]
    pub port_min: u16,
    #[serde(default = "default_port_max")]
    pub port_max: u16,
    #[serde(default = "default_startup_probe_ms")]
    pub startup_probe_ms: u64,
    #[serde(default = "default_runtime_command")]
    pub runtime_command: String,
    #[serde(default = "default_runtime_args")]
    pub runtime_args: Vec<String>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            root: default_root(),
            templates_dir: default_templates_dir(),
            port_min: default_port_min(),
            port_max: default_port_max(),
            startup_probe_ms: default_startup_probe_ms(),
            runtime_command: default_runtime_command(),
            runtime_args: default_runtime_args(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("sandbox")
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("sandbox/templates")
}

fn default_port_min() -> u16 {
    3000
}

fn default_port_max() -> u16 {
    4000
}

fn default_startup_probe_ms() -> u64 {
    1000
}

fn default_runtime_command() -> String {
    "bun".to_string()
}

fn default_runtime_args() -> Vec<String> {
    vec!["run".to_string(), "server.js".to_string()]
}
