use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use webloom_core::{AgentRunner, ConfigStore};
use webloom_providers::ProviderRegistry;
use webloom_sandbox::{PortAllocator, SandboxManager};
use webloom_storage::Storage;

mod http;

pub use http::serve;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn build_id() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<Storage>,
    pub config: ConfigStore,
    pub providers: ProviderRegistry,
    pub ports: Arc<PortAllocator>,
    pub sandbox: Arc<SandboxManager>,
    pub runner: AgentRunner,
    pub started_at_ms: u64,
}

impl AppState {
    pub fn new(
        storage: Arc<Storage>,
        config: ConfigStore,
        providers: ProviderRegistry,
        ports: Arc<PortAllocator>,
        sandbox: Arc<SandboxManager>,
        runner: AgentRunner,
    ) -> Self {
        Self {
            storage,
            config,
            providers,
            ports,
            sandbox,
            runner,
            started_at_ms: now_ms(),
        }
    }
}
