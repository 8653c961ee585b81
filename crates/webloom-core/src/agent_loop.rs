use std::path::PathBuf;
use std::pin::Pin;

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};

use webloom_providers::{ChatMessage, ProviderRegistry, StreamChunk};
use webloom_runtime::{ProviderGroup, ToolProviderSpec};
use webloom_tools::{validate_tool_schemas, ToolRegistry};
use webloom_types::{AgentEvent, ChatRecord, ProjectContext};

use crate::{normalize_run_item, AgentDefinition, RunItem, ToolInvocation};

const MAX_TURNS: usize = 25;

pub type AgentEventStream = Pin<Box<dyn Stream<Item = anyhow::Result<AgentEvent>> + Send>>;

/// Drives one agent run: provider streaming, tool execution, and the
/// normalization of internal run items into the external event schema.
#[derive(Clone)]
pub struct AgentRunner {
    providers: ProviderRegistry,
    sandbox_root: PathBuf,
    provider_specs: Vec<ToolProviderSpec>,
    provider_id: Option<String>,
    model_id: Option<String>,
}

impl AgentRunner {
    pub fn new(
        providers: ProviderRegistry,
        sandbox_root: impl Into<PathBuf>,
        provider_specs: Vec<ToolProviderSpec>,
    ) -> Self {
        Self {
            providers,
            sandbox_root: sandbox_root.into(),
            provider_specs,
            provider_id: None,
            model_id: None,
        }
    }

    pub fn with_model(mut self, provider_id: Option<String>, model_id: Option<String>) -> Self {
        self.provider_id = provider_id;
        self.model_id = model_id;
        self
    }

    /// One lazy, forward-only pass over an agent run. The stream suspends at
    /// every yield and resumes only when the consumer asks for the next
    /// event; a second consumer or out-of-order consumption is undefined.
    /// Errors surface as an `Err` item at the point the consumer next polls.
    pub fn run_streamed(
        &self,
        agent: AgentDefinition,
        conversation: Vec<ChatRecord>,
        context: ProjectContext,
    ) -> AgentEventStream {
        let providers = self.providers.clone();
        let sandbox_root = self.sandbox_root.clone();
        let provider_specs = self.provider_specs.clone();
        let provider_id = self.provider_id.clone();
        let model_id = self.model_id.clone();

        Box::pin(try_stream! {
            let tools = ToolRegistry::for_project(sandbox_root, &context);
            // Partial startup is fine: the run proceeds with whatever came up.
            // If an error below aborts the stream, each active provider's drop
            // backstop still kills its subprocess.
            let mut group = ProviderGroup::start(&provider_specs).await;
            tracing::info!(
                project_id = %context.id,
                active_providers = group.len(),
                "agent run starting"
            );

            if let Some(event) = normalize_run_item(&RunItem::AgentUpdated {
                agent_name: agent.name.clone(),
            }) {
                yield event;
            }

            let mut messages = vec![ChatMessage::new("system", system_prompt(&agent, &context))];
            messages.extend(
                conversation
                    .iter()
                    .map(|record| ChatMessage::new(record.role.clone(), record.content.clone())),
            );

            let mut remaining_turns = MAX_TURNS;
            loop {
                remaining_turns -= 1;

                let mut schemas = tools.list().await;
                schemas.extend(group.tool_schemas());
                validate_tool_schemas(&schemas).map_err(anyhow::Error::new)?;

                let stream = providers
                    .stream_for_provider(
                        provider_id.as_deref(),
                        model_id.as_deref(),
                        messages.clone(),
                        Some(schemas),
                    )
                    .await?;
                tokio::pin!(stream);

                let mut completion = String::new();
                let mut buffered_calls: Vec<ToolInvocation> = Vec::new();
                while let Some(chunk) = stream.next().await {
                    // Raw transport chunks never reach the consumer.
                    match chunk? {
                        StreamChunk::TextDelta(delta) => completion.push_str(&delta),
                        StreamChunk::ToolCallStart { id, name } => {
                            let call = buffered_call(&mut buffered_calls, &id);
                            if call.name.is_empty() {
                                call.name = name;
                            }
                        }
                        StreamChunk::ToolCallDelta { id, args_delta } => {
                            buffered_call(&mut buffered_calls, &id)
                                .arguments
                                .push_str(&args_delta);
                        }
                        StreamChunk::ToolCallEnd { .. } => {}
                        StreamChunk::Done { .. } => break,
                    }
                }

                let calls = buffered_calls
                    .into_iter()
                    .filter(|call| !call.name.trim().is_empty())
                    .collect::<Vec<_>>();

                if calls.is_empty() || remaining_turns == 0 {
                    if let Some(event) = normalize_run_item(&RunItem::MessageProduced {
                        content: completion.clone(),
                    }) {
                        yield event;
                    }
                    break;
                }

                if !completion.trim().is_empty() {
                    messages.push(ChatMessage::new("assistant", completion.clone()));
                }

                for call in calls {
                    if let Some(event) = normalize_run_item(&RunItem::ToolCallRequested {
                        call: call.clone(),
                    }) {
                        yield event;
                    }

                    let args = parse_call_arguments(&call.arguments);
                    let output = if group.owns_tool(&call.name) {
                        match group.call(&call.name, args).await {
                            Ok(result) => result.output,
                            Err(err) => format!("Error executing tool {}: {err}", call.name),
                        }
                    } else {
                        match tools.execute(&call.name, args).await {
                            Ok(result) => result.output,
                            Err(err) => format!("Error executing tool {}: {err}", call.name),
                        }
                    };

                    if let Some(event) = normalize_run_item(&RunItem::ToolCallCompleted {
                        call: call.clone(),
                        output: output.clone(),
                    }) {
                        yield event;
                    }

                    messages.push(ChatMessage::new(
                        "assistant",
                        format!(
                            "Calling tool `{}` with arguments: {}",
                            call.name, call.arguments
                        ),
                    ));
                    messages.push(ChatMessage::new(
                        "user",
                        format!("Tool `{}` returned:\n{output}", call.name),
                    ));
                }
            }

            tracing::info!(project_id = %context.id, "agent run finished");
            group.shutdown().await;
        })
    }
}

fn system_prompt(agent: &AgentDefinition, context: &ProjectContext) -> String {
    format!(
        "{}\n\nProject: {} (id: {}). The app is served from the project sandbox at http://localhost:{}.",
        agent.instructions, context.name, context.id, context.port
    )
}

fn buffered_call<'a>(calls: &'a mut Vec<ToolInvocation>, id: &str) -> &'a mut ToolInvocation {
    if let Some(idx) = calls.iter().position(|c| c.id == id) {
        return &mut calls[idx];
    }
    calls.push(ToolInvocation {
        id: id.to_string(),
        ..ToolInvocation::default()
    });
    calls.last_mut().expect("just pushed")
}

fn parse_call_arguments(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| json!({}))
}
