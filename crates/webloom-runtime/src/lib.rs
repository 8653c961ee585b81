use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use webloom_types::{ToolResult, ToolSchema};

const RPC_PROTOCOL_VERSION: &str = "2025-11-25";
const RPC_CLIENT_NAME: &str = "webloom";
const RPC_CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Launch description for one auxiliary tool provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolProviderSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// The fixed provider set for an agent run: a library-docs provider and a
/// live-search provider, both npx-launched.
pub fn default_provider_specs() -> Vec<ToolProviderSpec> {
    let env = HashMap::from([("DEFAULT_MINIMUM_TOKENS".to_string(), "10000".to_string())]);
    vec![
        ToolProviderSpec {
            name: "context7".to_string(),
            command: "npx".to_string(),
            args: vec!["-y".to_string(), "@upstash/context7-mcp@latest".to_string()],
            env: env.clone(),
        },
        ToolProviderSpec {
            name: "livesearch".to_string(),
            command: "npx".to_string(),
            args: vec!["-y".to_string(), "@upstash/context7-mcp@latest".to_string()],
            env,
        },
    ]
}

/// A provider that started successfully: the subprocess plus its stdio
/// JSON-RPC channel and the tools it advertised at startup.
pub struct ActiveProvider {
    pub name: String,
    pub pid: Option<u32>,
    tools: Vec<ToolSchema>,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_request_id: u64,
}

impl ActiveProvider {
    async fn start(spec: &ToolProviderSpec) -> anyhow::Result<Self> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("provider stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| anyhow::anyhow!("provider stdout unavailable"))?;

        let mut provider = Self {
            name: spec.name.clone(),
            pid: child.id(),
            tools: Vec::new(),
            child,
            stdin,
            stdout,
            next_request_id: 0,
        };

        let init = provider
            .request(
                "initialize",
                json!({
                    "protocolVersion": RPC_PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": RPC_CLIENT_NAME,
                        "version": RPC_CLIENT_VERSION,
                    }
                }),
            )
            .await?;
        if let Some(message) = rpc_error_message(&init) {
            anyhow::bail!("initialize failed: {message}");
        }

        let listed = provider.request("tools/list", json!({})).await?;
        if let Some(message) = rpc_error_message(&listed) {
            anyhow::bail!("tools/list failed: {message}");
        }
        provider.tools = parse_tool_rows(&listed);

        Ok(provider)
    }

    pub fn tools(&self) -> &[ToolSchema] {
        &self.tools
    }

    pub async fn call_tool(&mut self, tool_name: &str, args: Value) -> anyhow::Result<ToolResult> {
        let response = self
            .request(
                "tools/call",
                json!({"name": tool_name, "arguments": args}),
            )
            .await?;
        if let Some(message) = rpc_error_message(&response) {
            anyhow::bail!(message);
        }
        let result = response.get("result").cloned().unwrap_or(Value::Null);
        let output = result
            .get("content")
            .map(render_rpc_content)
            .unwrap_or_else(|| result.to_string());
        Ok(ToolResult {
            output,
            metadata: json!({
                "provider": self.name,
                "tool": tool_name,
                "result": result,
            }),
        })
    }

    async fn request(&mut self, method: &str, params: Value) -> anyhow::Result<Value> {
        self.next_request_id += 1;
        let id = self.next_request_id;
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        tokio::time::timeout(RPC_TIMEOUT, self.read_response(id))
            .await
            .map_err(|_| anyhow::anyhow!("provider `{}` timed out on {method}", self.name))?
    }

    async fn read_response(&mut self, id: u64) -> anyhow::Result<Value> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self.stdout.read_line(&mut line).await?;
            if read == 0 {
                anyhow::bail!("provider `{}` closed its stdout", self.name);
            }
            let Ok(value) = serde_json::from_str::<Value>(line.trim()) else {
                continue;
            };
            let matches_id = value.get("id").and_then(Value::as_u64) == Some(id);
            let is_response = value.get("result").is_some() || value.get("error").is_some();
            if matches_id && is_response {
                return Ok(value);
            }
        }
    }

    async fn teardown(&mut self) {
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

impl Drop for ActiveProvider {
    fn drop(&mut self) {
        // Backstop for consumers that abandon the group without shutdown().
        let _ = self.child.start_kill();
    }
}

/// Scoped group of auxiliary providers for one agent run. Startup is
/// best-effort per provider; teardown covers every member that started,
/// in reverse-of-registration order.
pub struct ProviderGroup {
    active: Vec<ActiveProvider>,
}

impl ProviderGroup {
    pub async fn start(specs: &[ToolProviderSpec]) -> Self {
        let mut active = Vec::new();
        for spec in specs {
            match ActiveProvider::start(spec).await {
                Ok(provider) => {
                    tracing::info!(
                        provider = %provider.name,
                        pid = provider.pid.unwrap_or(0),
                        tools = provider.tools.len(),
                        "tool provider started"
                    );
                    active.push(provider);
                }
                Err(err) => {
                    tracing::error!(
                        provider = %spec.name,
                        error = %err,
                        "failed to initialize tool provider, continuing without it"
                    );
                }
            }
        }
        Self { active }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn active_names(&self) -> Vec<String> {
        self.active.iter().map(|p| p.name.clone()).collect()
    }

    /// Advertised tools across all active providers, namespaced so the agent
    /// can address a provider without ambiguity.
    pub fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.active
            .iter()
            .flat_map(|provider| {
                provider.tools.iter().map(|tool| ToolSchema {
                    name: namespaced_tool_name(&provider.name, &tool.name),
                    description: tool.description.clone(),
                    input_schema: tool.input_schema.clone(),
                })
            })
            .collect()
    }

    /// Route a namespaced tool call to the provider that owns it.
    pub async fn call(&mut self, namespaced: &str, args: Value) -> anyhow::Result<ToolResult> {
        let target = self.active.iter().enumerate().find_map(|(idx, provider)| {
            provider
                .tools
                .iter()
                .find(|t| namespaced_tool_name(&provider.name, &t.name) == namespaced)
                .map(|t| (idx, t.name.clone()))
        });
        let Some((idx, tool_name)) = target else {
            anyhow::bail!("no active provider exposes tool `{namespaced}`");
        };
        self.active[idx].call_tool(&tool_name, args).await
    }

    pub fn owns_tool(&self, namespaced: &str) -> bool {
        self.active.iter().any(|provider| {
            provider
                .tools
                .iter()
                .any(|t| namespaced_tool_name(&provider.name, &t.name) == namespaced)
        })
    }

    pub async fn shutdown(mut self) {
        while let Some(mut provider) = self.active.pop() {
            tracing::info!(provider = %provider.name, "stopping tool provider");
            provider.teardown().await;
        }
    }
}

pub fn namespaced_tool_name(provider: &str, tool: &str) -> String {
    format!(
        "aux_{}_{}",
        sanitize_segment(provider),
        sanitize_segment(tool)
    )
}

fn sanitize_segment(raw: &str) -> String {
    let mut out = String::new();
    let mut previous_underscore = false;
    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            previous_underscore = false;
        } else if !previous_underscore {
            out.push('_');
            previous_underscore = true;
        }
    }
    let cleaned = out.trim_matches('_');
    if cleaned.is_empty() {
        "tool".to_string()
    } else {
        cleaned.to_string()
    }
}

fn rpc_error_message(response: &Value) -> Option<String> {
    response
        .get("error")
        .map(|err| {
            err.get("message")
                .and_then(Value::as_str)
                .unwrap_or("provider request failed")
                .to_string()
        })
}

fn parse_tool_rows(response: &Value) -> Vec<ToolSchema> {
    let Some(rows) = response
        .get("result")
        .and_then(|v| v.get("tools"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let name = row.get("name").and_then(Value::as_str)?;
            Some(ToolSchema {
                name: name.to_string(),
                description: row
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                input_schema: row
                    .get("inputSchema")
                    .or_else(|| row.get("input_schema"))
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object"})),
            })
        })
        .collect()
}

fn render_rpc_content(value: &Value) -> String {
    let Some(items) = value.as_array() else {
        return value.to_string();
    };
    let mut chunks = Vec::new();
    for item in items {
        if let Some(text) = item.get("text").and_then(Value::as_str) {
            chunks.push(text.to_string());
            continue;
        }
        chunks.push(item.to_string());
    }
    if chunks.is_empty() {
        value.to_string()
    } else {
        chunks.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Shell stand-in for a stdio provider: answers every request line with a
    /// well-formed response carrying an incrementing id and an empty tool set.
    fn scripted_provider(name: &str) -> ToolProviderSpec {
        ToolProviderSpec {
            name: name.to_string(),
            command: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                r#"i=0; while read line; do i=$((i+1)); printf '{"jsonrpc":"2.0","id":%d,"result":{"tools":[]}}\n' "$i"; done"#
                    .to_string(),
            ],
            env: HashMap::new(),
        }
    }

    fn broken_provider(name: &str) -> ToolProviderSpec {
        ToolProviderSpec {
            name: name.to_string(),
            command: "webloom-no-such-binary".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn partial_startup_keeps_the_survivors() {
        let specs = vec![
            scripted_provider("docs"),
            broken_provider("search"),
            scripted_provider("extra"),
        ];
        let group = ProviderGroup::start(&specs).await;
        assert_eq!(group.len(), 2);
        assert_eq!(group.active_names(), vec!["docs", "extra"]);
        group.shutdown().await;
    }

    #[tokio::test]
    async fn total_startup_failure_still_yields_a_working_group() {
        let specs = vec![broken_provider("a"), broken_provider("b")];
        let group = ProviderGroup::start(&specs).await;
        assert!(group.is_empty());
        assert!(group.tool_schemas().is_empty());
        group.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_namespaced_tool_is_rejected() {
        let mut group = ProviderGroup::start(&[scripted_provider("docs")]).await;
        assert!(!group.owns_tool("aux_docs_lookup"));
        let err = group
            .call("aux_docs_lookup", json!({}))
            .await
            .err()
            .expect("expected error");
        assert!(err.to_string().contains("no active provider"));
        group.shutdown().await;
    }

    #[test]
    fn namespacing_sanitizes_awkward_segments() {
        assert_eq!(
            namespaced_tool_name("Context7 MCP", "resolve-library-id"),
            "aux_context7_mcp_resolve_library_id"
        );
        assert_eq!(namespaced_tool_name("", ""), "aux_tool_tool");
    }

    #[test]
    fn default_specs_cover_both_configured_providers() {
        let specs = default_provider_specs();
        assert_eq!(specs.len(), 2);
        assert!(specs.iter().all(|s| s.command == "npx"));
        assert!(specs
            .iter()
            .all(|s| s.env.contains_key("DEFAULT_MINIMUM_TOKENS")));
    }
}
