use std::collections::HashMap;
use std::sync::Arc;
use std::{pin::Pin, str};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use webloom_types::ToolSchema;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Incremental output of one streamed completion. Raw text deltas and
/// tool-call fragments arrive interleaved; `Done` closes the turn.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    TextDelta(String),
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, args_delta: String },
    ToolCallEnd { id: String },
    Done { finish_reason: String },
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> String;

    async fn complete(&self, prompt: &str, model_override: Option<&str>) -> anyhow::Result<String>;

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
        _tools: Option<Vec<ToolSchema>>,
    ) -> anyhow::Result<ChunkStream> {
        let prompt = messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let response = self.complete(&prompt, model_override).await?;
        let stream = futures::stream::iter(vec![
            Ok(StreamChunk::TextDelta(response)),
            Ok(StreamChunk::Done {
                finish_reason: "stop".to_string(),
            }),
        ]);
        Ok(Box::pin(stream))
    }
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<Vec<Arc<dyn Provider>>>,
    default_provider: Option<String>,
}

impl ProviderRegistry {
    pub fn new(config: ProvidersConfig) -> Self {
        Self {
            providers: Arc::new(build_providers(&config)),
            default_provider: config.default_provider,
        }
    }

    pub fn from_providers(providers: Vec<Arc<dyn Provider>>, default_provider: Option<String>) -> Self {
        Self {
            providers: Arc::new(providers),
            default_provider,
        }
    }

    pub fn list_ids(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.id()).collect()
    }

    pub async fn default_complete(&self, prompt: &str) -> anyhow::Result<String> {
        let provider = self.select_provider(None)?;
        provider.complete(prompt, None).await
    }

    pub async fn stream_for_provider(
        &self,
        provider_id: Option<&str>,
        model_id: Option<&str>,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolSchema>>,
    ) -> anyhow::Result<ChunkStream> {
        let provider = self.select_provider(provider_id)?;
        provider.stream(messages, model_id, tools).await
    }

    pub fn select_provider(&self, provider_id: Option<&str>) -> anyhow::Result<Arc<dyn Provider>> {
        let available = self.list_ids();

        if let Some(id) = provider_id {
            if let Some(provider) = self.providers.iter().find(|p| p.id() == id) {
                return Ok(provider.clone());
            }
            anyhow::bail!(
                "provider `{}` is not configured. configured providers: {}",
                id,
                available.join(", ")
            );
        }

        if let Some(default_id) = self.default_provider.as_deref() {
            if let Some(provider) = self.providers.iter().find(|p| p.id() == default_id) {
                return Ok(provider.clone());
            }
        }

        let Some(provider) = self.providers.first() else {
            anyhow::bail!("No provider configured.");
        };
        Ok(provider.clone())
    }
}

fn build_providers(config: &ProvidersConfig) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    for (id, defaults) in [
        ("openai", ("https://api.openai.com/v1", "gpt-4o-mini")),
        ("openrouter", ("https://openrouter.ai/api/v1", "openai/gpt-4o-mini")),
        ("groq", ("https://api.groq.com/openai/v1", "llama-3.1-8b-instant")),
        ("ollama", ("http://127.0.0.1:11434/v1", "llama3.1:8b")),
    ] {
        let Some(entry) = config.providers.get(id) else {
            continue;
        };
        providers.push(Arc::new(OpenAiCompatibleProvider {
            id: id.to_string(),
            base_url: normalize_base(entry.url.as_deref().unwrap_or(defaults.0)),
            api_key: entry
                .api_key
                .as_deref()
                .filter(|key| !is_placeholder_api_key(key))
                .map(|key| key.to_string())
                .or_else(|| env_api_key_for_provider(id)),
            default_model: entry
                .default_model
                .clone()
                .unwrap_or_else(|| defaults.1.to_string()),
            client: Client::new(),
        }));
    }

    if providers.is_empty() {
        providers.push(Arc::new(LocalEchoProvider));
    }

    providers
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

fn env_api_key_for_provider(id: &str) -> Option<String> {
    let env_name = match id {
        "openai" => Some("OPENAI_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "groq" => Some("GROQ_API_KEY"),
        _ => None,
    }?;
    std::env::var(env_name)
        .ok()
        .filter(|v| !v.trim().is_empty())
}

struct LocalEchoProvider;

#[async_trait]
impl Provider for LocalEchoProvider {
    fn id(&self) -> String {
        "local".to_string()
    }

    async fn complete(
        &self,
        prompt: &str,
        _model_override: Option<&str>,
    ) -> anyhow::Result<String> {
        Ok(format!("Echo: {prompt}"))
    }
}

struct OpenAiCompatibleProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn complete(&self, prompt: &str, model_override: Option<&str>) -> anyhow::Result<String> {
        let model = model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str());
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(url).json(&json!({
            "model": model,
            "messages": [{"role":"user","content": prompt}],
            "stream": false,
        }));
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        let response = req.send().await?;
        let status = response.status();
        let value: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let detail = extract_error(&value)
                .unwrap_or_else(|| format!("provider request failed with status {}", status));
            anyhow::bail!(detail);
        }
        if let Some(detail) = extract_error(&value) {
            anyhow::bail!(detail);
        }

        value
            .get("choices")
            .and_then(|v| v.get(0))
            .and_then(|v| v.get("message"))
            .and_then(|v| v.get("content"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "provider returned no completion content for model `{}` (response: {})",
                    model,
                    truncate_for_error(&value.to_string(), 500)
                )
            })
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
        tools: Option<Vec<ToolSchema>>,
    ) -> anyhow::Result<ChunkStream> {
        let model = model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str());
        let url = format!("{}/chat/completions", self.base_url);
        let wire_messages = messages
            .into_iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect::<Vec<_>>();

        let wire_tools = tools
            .unwrap_or_default()
            .into_iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut body = json!({
            "model": model,
            "messages": wire_messages,
            "stream": true,
        });
        if !wire_tools.is_empty() {
            body["tools"] = serde_json::Value::Array(wire_tools);
            body["tool_choice"] = json!("auto");
        }

        let mut req = self.client.post(url).json(&body);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "provider stream request failed with status {}: {}",
                status,
                truncate_for_error(&text, 500)
            );
        }

        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk?;
                buffer.push_str(str::from_utf8(&chunk).unwrap_or_default());

                while let Some(pos) = buffer.find("\n\n") {
                    let frame = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();
                    for line in frame.lines() {
                        if !line.starts_with("data: ") {
                            continue;
                        }
                        let payload = line.trim_start_matches("data: ").trim();
                        if payload == "[DONE]" {
                            yield StreamChunk::Done {
                                finish_reason: "stop".to_string(),
                            };
                            continue;
                        }

                        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
                            continue;
                        };

                        if let Some(detail) = extract_error(&value) {
                            Err(anyhow::anyhow!(detail))?;
                        }

                        let choices = value
                            .get("choices")
                            .and_then(|v| v.as_array())
                            .cloned()
                            .unwrap_or_default();
                        for choice in choices {
                            let delta = choice.get("delta").cloned().unwrap_or_default();

                            if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                                if !text.is_empty() {
                                    yield StreamChunk::TextDelta(text.to_string());
                                }
                            }

                            if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                                for call in tool_calls {
                                    let id = call
                                        .get("id")
                                        .and_then(|v| v.as_str())
                                        .unwrap_or_default()
                                        .to_string();
                                    let function = call.get("function").cloned().unwrap_or_default();
                                    let name = function
                                        .get("name")
                                        .and_then(|v| v.as_str())
                                        .unwrap_or_default()
                                        .to_string();
                                    let args_delta = function
                                        .get("arguments")
                                        .and_then(|v| v.as_str())
                                        .unwrap_or_default()
                                        .to_string();

                                    if !id.is_empty() && !name.is_empty() {
                                        yield StreamChunk::ToolCallStart {
                                            id: id.clone(),
                                            name,
                                        };
                                    }
                                    if !id.is_empty() && !args_delta.is_empty() {
                                        yield StreamChunk::ToolCallDelta {
                                            id: id.clone(),
                                            args_delta,
                                        };
                                    }
                                    if !id.is_empty() {
                                        yield StreamChunk::ToolCallEnd { id };
                                    }
                                }
                            }

                            if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                                if !reason.is_empty() {
                                    yield StreamChunk::Done {
                                        finish_reason: reason.to_string(),
                                    };
                                }
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

fn normalize_base(input: &str) -> String {
    if input.ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        format!("{}...", &input[..max_len])
    }
}

fn extract_error(value: &serde_json::Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(provider_ids: &[&str], default_provider: Option<&str>) -> ProvidersConfig {
        let mut providers = HashMap::new();
        for id in provider_ids {
            providers.insert(
                (*id).to_string(),
                ProviderConfig {
                    api_key: Some("sk-test".to_string()),
                    url: None,
                    default_model: Some(format!("{id}-model")),
                },
            );
        }
        ProvidersConfig {
            providers,
            default_provider: default_provider.map(|s| s.to_string()),
        }
    }

    #[test]
    fn explicit_provider_wins_over_default_provider() {
        let registry = ProviderRegistry::new(cfg(&["openai", "openrouter"], Some("openai")));
        let provider = registry
            .select_provider(Some("openrouter"))
            .expect("provider");
        assert_eq!(provider.id(), "openrouter");
    }

    #[test]
    fn uses_default_provider_when_no_explicit_choice() {
        let registry = ProviderRegistry::new(cfg(&["openai", "openrouter"], Some("openrouter")));
        let provider = registry.select_provider(None).expect("provider");
        assert_eq!(provider.id(), "openrouter");
    }

    #[test]
    fn falls_back_to_first_provider_when_default_missing() {
        let registry = ProviderRegistry::new(cfg(&["openai"], Some("groq")));
        let provider = registry.select_provider(None).expect("provider");
        assert_eq!(provider.id(), "openai");
    }

    #[test]
    fn explicit_unknown_provider_errors() {
        let registry = ProviderRegistry::new(cfg(&["openai"], None));
        let err = registry
            .select_provider(Some("openruter"))
            .err()
            .expect("expected error");
        assert!(err
            .to_string()
            .contains("provider `openruter` is not configured"));
    }

    #[test]
    fn empty_config_gets_echo_fallback() {
        let registry = ProviderRegistry::new(ProvidersConfig::default());
        let provider = registry.select_provider(None).expect("provider");
        assert_eq!(provider.id(), "local");
    }

    #[test]
    fn base_url_normalization_appends_v1_once() {
        assert_eq!(normalize_base("https://api.example.com"), "https://api.example.com/v1");
        assert_eq!(normalize_base("https://api.example.com/v1"), "https://api.example.com/v1");
    }
}
