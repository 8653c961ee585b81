use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::fs;
use tokio::sync::RwLock;

use webloom_types::{ProjectContext, ToolResult, ToolSchema};

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult>;
}

#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registry for one agent run: file tools bound to the run's project
    /// sandbox. The project id comes from the run context, never from tool
    /// arguments, so one run cannot reach another project's files.
    pub fn for_project(sandbox_root: impl Into<PathBuf>, context: &ProjectContext) -> Self {
        let root: PathBuf = sandbox_root.into();
        let mut map: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        map.insert(
            "read_file".to_string(),
            Arc::new(ReadFileTool {
                root: root.clone(),
                project_id: context.id.clone(),
            }),
        );
        map.insert(
            "write_file".to_string(),
            Arc::new(WriteFileTool {
                root,
                project_id: context.id.clone(),
            }),
        );
        Self {
            tools: Arc::new(RwLock::new(map)),
        }
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.schema().name;
        self.tools.write().await.insert(name, tool);
    }

    pub async fn list(&self) -> Vec<ToolSchema> {
        let mut schemas = self
            .tools
            .read()
            .await
            .values()
            .map(|t| t.schema())
            .collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn execute(&self, name: &str, args: Value) -> anyhow::Result<ToolResult> {
        let tool = self.tools.read().await.get(name).cloned();
        let Some(tool) = tool else {
            return Ok(ToolResult {
                output: format!("Unknown tool: {name}"),
                metadata: json!({}),
            });
        };
        tool.execute(args).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

pub fn validate_tool_schemas(schemas: &[ToolSchema]) -> Result<(), ToolSchemaValidationError> {
    for schema in schemas {
        validate_schema_node(&schema.name, "$", &schema.input_schema)?;
    }
    Ok(())
}

fn validate_schema_node(
    tool_name: &str,
    path: &str,
    value: &Value,
) -> Result<(), ToolSchemaValidationError> {
    let Some(obj) = value.as_object() else {
        if let Some(arr) = value.as_array() {
            for (idx, item) in arr.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}[{idx}]"), item)?;
            }
        }
        return Ok(());
    };

    if obj.get("type").and_then(|t| t.as_str()) == Some("array") && !obj.contains_key("items") {
        return Err(ToolSchemaValidationError {
            tool_name: tool_name.to_string(),
            path: path.to_string(),
            reason: "array schema missing items".to_string(),
        });
    }

    if let Some(items) = obj.get("items") {
        validate_schema_node(tool_name, &format!("{path}.items"), items)?;
    }
    if let Some(props) = obj.get("properties").and_then(|v| v.as_object()) {
        for (key, child) in props {
            validate_schema_node(tool_name, &format!("{path}.properties.{key}"), child)?;
        }
    }

    Ok(())
}

/// Resolve a caller-supplied filename inside the project's sandbox directory.
/// Absolute paths and parent-dir components are rejected before any I/O.
fn sandbox_file_path(root: &Path, project_id: &str, filename: &str) -> Result<PathBuf, String> {
    let raw = Path::new(filename);
    if filename.trim().is_empty() {
        return Err("missing filename".to_string());
    }
    if raw.is_absolute() {
        return Err(format!("filename `{filename}` must be relative"));
    }
    if raw
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        return Err(format!("filename `{filename}` escapes the project sandbox"));
    }
    Ok(root.join("projects").join(project_id).join(raw))
}

fn tool_error(message: String) -> ToolResult {
    ToolResult {
        output: message,
        metadata: json!({"error": true}),
    }
}

struct ReadFileTool {
    root: PathBuf,
    project_id: String,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "read_file".to_string(),
            description: "Read a file from the project sandbox".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"filename": {"type": "string"}},
                "required": ["filename"]
            }),
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let filename = args["filename"].as_str().unwrap_or("");
        let path = match sandbox_file_path(&self.root, &self.project_id, filename) {
            Ok(path) => path,
            Err(message) => return Ok(tool_error(message)),
        };
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(ToolResult {
                output: format!("File {filename} has been read, content: {content}"),
                metadata: json!({"filename": filename}),
            }),
            Err(err) => Ok(tool_error(format!("Error reading file {filename}: {err}"))),
        }
    }
}

struct WriteFileTool {
    root: PathBuf,
    project_id: String,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "write_file".to_string(),
            description: "Create or overwrite a file in the project sandbox".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "filename": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["filename", "content"]
            }),
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let filename = args["filename"].as_str().unwrap_or("");
        let content = args["content"].as_str().unwrap_or("");
        let path = match sandbox_file_path(&self.root, &self.project_id, filename) {
            Ok(path) => path,
            Err(message) => return Ok(tool_error(message)),
        };
        if let Some(parent) = path.parent() {
            if let Err(err) = fs::create_dir_all(parent).await {
                return Ok(tool_error(format!(
                    "Error writing file {filename}: {err}"
                )));
            }
        }
        match fs::write(&path, content).await {
            Ok(()) => Ok(ToolResult {
                output: format!("File {filename} has been written"),
                metadata: json!({"filename": filename, "bytes": content.len()}),
            }),
            Err(err) => Ok(tool_error(format!("Error writing file {filename}: {err}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(id: &str) -> ProjectContext {
        ProjectContext {
            id: id.to_string(),
            name: "Demo".to_string(),
            port: 3000,
        }
    }

    #[test]
    fn identical_filenames_resolve_to_disjoint_project_paths() {
        let root = Path::new("/srv/sandbox");
        let a = sandbox_file_path(root, "project-a", "index.html").expect("path");
        let b = sandbox_file_path(root, "project-b", "index.html").expect("path");
        assert_ne!(a, b);
        assert!(a.starts_with("/srv/sandbox/projects/project-a"));
        assert!(b.starts_with("/srv/sandbox/projects/project-b"));
    }

    #[test]
    fn traversal_and_absolute_filenames_are_rejected() {
        let root = Path::new("/srv/sandbox");
        assert!(sandbox_file_path(root, "p", "../other/index.html").is_err());
        assert!(sandbox_file_path(root, "p", "/etc/passwd").is_err());
        assert!(sandbox_file_path(root, "p", "").is_err());
        assert!(sandbox_file_path(root, "p", "css/style.css").is_ok());
    }

    #[tokio::test]
    async fn write_then_read_round_trips_within_the_sandbox() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ToolRegistry::for_project(dir.path(), &context("project-a"));

        let written = registry
            .execute(
                "write_file",
                json!({"filename": "index.html", "content": "<h1>hi</h1>"}),
            )
            .await
            .expect("write");
        assert_eq!(written.output, "File index.html has been written");

        let read = registry
            .execute("read_file", json!({"filename": "index.html"}))
            .await
            .expect("read");
        assert!(read.output.contains("<h1>hi</h1>"));
        assert!(dir
            .path()
            .join("projects/project-a/index.html")
            .exists());
    }

    #[tokio::test]
    async fn missing_file_surfaces_as_tool_level_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ToolRegistry::for_project(dir.path(), &context("project-a"));

        let result = registry
            .execute("read_file", json!({"filename": "missing.html"}))
            .await
            .expect("tool call itself must not fail");
        assert!(result.output.starts_with("Error reading file missing.html"));
        assert_eq!(result.metadata["error"], json!(true));
    }

    #[tokio::test]
    async fn unknown_tool_reports_instead_of_failing() {
        let registry = ToolRegistry::new();
        let result = registry.execute("bash", json!({})).await.expect("result");
        assert_eq!(result.output, "Unknown tool: bash");
    }

    #[test]
    fn validator_rejects_array_without_items() {
        let schemas = vec![ToolSchema {
            name: "bad".to_string(),
            description: "bad schema".to_string(),
            input_schema: json!({
                "type":"object",
                "properties":{"files":{"type":"array"}}
            }),
        }];
        let err = validate_tool_schemas(&schemas).expect_err("expected schema validation failure");
        assert_eq!(err.tool_name, "bad");
        assert!(err.path.contains("properties.files"));
    }
}
