use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use tokio::fs;
use tokio::sync::RwLock;

use webloom_types::{ChatRecord, Project, Session, SANDBOX_ERROR_KEY, SANDBOX_STATUS_KEY};

const PROJECTS_FILE: &str = "projects.json";
const SESSIONS_FILE: &str = "sessions.json";

/// File-backed store of projects and sessions. Records are held in memory
/// behind `RwLock`s and flushed to pretty JSON after every mutation; rows are
/// soft-deleted, never removed, so port history stays inspectable.
pub struct Storage {
    base: PathBuf,
    projects: RwLock<HashMap<String, Project>>,
    sessions: RwLock<HashMap<String, Session>>,
}

impl Storage {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        let projects = load_map::<Project>(&base.join(PROJECTS_FILE)).await;
        let sessions = load_map::<Session>(&base.join(SESSIONS_FILE)).await;
        Ok(Self {
            base,
            projects: RwLock::new(projects),
            sessions: RwLock::new(sessions),
        })
    }

    // --- projects ---

    pub async fn list_projects(&self) -> Vec<Project> {
        let mut rows = self
            .projects
            .read()
            .await
            .values()
            .filter(|p| !p.is_deleted)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        rows
    }

    pub async fn get_project(&self, id: &str) -> Option<Project> {
        self.projects
            .read()
            .await
            .get(id)
            .filter(|p| !p.is_deleted)
            .cloned()
    }

    pub async fn save_project(&self, mut project: Project) -> anyhow::Result<Project> {
        project.updated_at = Utc::now();
        self.projects
            .write()
            .await
            .insert(project.id.clone(), project.clone());
        self.flush_projects().await?;
        Ok(project)
    }

    pub async fn soft_delete_project(&self, id: &str) -> anyhow::Result<bool> {
        {
            let mut projects = self.projects.write().await;
            let Some(project) = projects.get_mut(id).filter(|p| !p.is_deleted) else {
                return Ok(false);
            };
            project.is_deleted = true;
            project.updated_at = Utc::now();
        }
        self.flush_projects().await?;
        Ok(true)
    }

    /// Ports currently assigned to non-deleted projects.
    pub async fn used_ports(&self) -> HashSet<u16> {
        self.projects
            .read()
            .await
            .values()
            .filter(|p| !p.is_deleted)
            .map(|p| p.port)
            .collect()
    }

    pub async fn project_holding_port(&self, port: u16) -> Option<Project> {
        self.projects
            .read()
            .await
            .values()
            .find(|p| !p.is_deleted && p.port == port)
            .cloned()
    }

    pub async fn set_server_pid(&self, id: &str, pid: Option<u32>) -> anyhow::Result<bool> {
        {
            let mut projects = self.projects.write().await;
            let Some(project) = projects.get_mut(id) else {
                return Ok(false);
            };
            project.server_pid = pid;
            project.updated_at = Utc::now();
        }
        self.flush_projects().await?;
        Ok(true)
    }

    /// Record sandbox diagnostics into project metadata. Best-effort data;
    /// the project record stands regardless of what lands here.
    pub async fn set_sandbox_metadata(
        &self,
        id: &str,
        status: &str,
        detail: &str,
    ) -> anyhow::Result<bool> {
        {
            let mut projects = self.projects.write().await;
            let Some(project) = projects.get_mut(id) else {
                return Ok(false);
            };
            project
                .metadata
                .insert(SANDBOX_STATUS_KEY.to_string(), Value::from(status));
            project
                .metadata
                .insert(SANDBOX_ERROR_KEY.to_string(), Value::from(detail));
            project.updated_at = Utc::now();
        }
        self.flush_projects().await?;
        Ok(true)
    }

    // --- sessions ---

    pub async fn list_sessions(&self, project_id: Option<&str>) -> Vec<Session> {
        let mut rows = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| !s.is_deleted)
            .filter(|s| project_id.map(|pid| s.project_id == pid).unwrap_or(true))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        rows
    }

    pub async fn get_session(&self, id: &str) -> Option<Session> {
        self.sessions
            .read()
            .await
            .get(id)
            .filter(|s| !s.is_deleted)
            .cloned()
    }

    pub async fn save_session(&self, mut session: Session) -> anyhow::Result<Session> {
        session.updated_at = Utc::now();
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        self.flush_sessions().await?;
        Ok(session)
    }

    pub async fn soft_delete_session(&self, id: &str) -> anyhow::Result<bool> {
        {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(id).filter(|s| !s.is_deleted) else {
                return Ok(false);
            };
            session.is_deleted = true;
            session.updated_at = Utc::now();
        }
        self.flush_sessions().await?;
        Ok(true)
    }

    /// Append transcript turns to a session. Called exactly once per cleanly
    /// drained agent stream.
    pub async fn append_messages(
        &self,
        session_id: &str,
        records: Vec<ChatRecord>,
    ) -> anyhow::Result<bool> {
        {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(session_id).filter(|s| !s.is_deleted) else {
                return Ok(false);
            };
            session.messages.extend(records);
            session.updated_at = Utc::now();
        }
        self.flush_sessions().await?;
        Ok(true)
    }

    // --- persistence ---

    async fn flush_projects(&self) -> anyhow::Result<()> {
        let snapshot = self.projects.read().await.clone();
        write_map(&self.base.join(PROJECTS_FILE), &snapshot).await
    }

    async fn flush_sessions(&self) -> anyhow::Result<()> {
        let snapshot = self.sessions.read().await.clone();
        write_map(&self.base.join(SESSIONS_FILE), &snapshot).await
    }
}

async fn load_map<T: serde::de::DeserializeOwned>(path: &Path) -> HashMap<String, T> {
    let Ok(raw) = fs::read_to_string(path).await else {
        return HashMap::new();
    };
    serde_json::from_str::<HashMap<String, T>>(&raw).unwrap_or_default()
}

async fn write_map<T: serde::Serialize>(
    path: &Path,
    map: &HashMap<String, T>,
) -> anyhow::Result<()> {
    let payload = serde_json::to_string_pretty(map)?;
    fs::write(path, payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use webloom_types::{SANDBOX_STATUS_FAILED, SANDBOX_STATUS_INITIALIZED};

    async fn store() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::new(dir.path()).await.expect("storage");
        (dir, storage)
    }

    #[tokio::test]
    async fn used_ports_excludes_deleted_projects() {
        let (_dir, storage) = store().await;
        let keep = storage
            .save_project(Project::new("keep", None, 3001))
            .await
            .expect("save");
        let drop = storage
            .save_project(Project::new("drop", None, 3002))
            .await
            .expect("save");
        assert!(storage.soft_delete_project(&drop.id).await.expect("delete"));

        let ports = storage.used_ports().await;
        assert!(ports.contains(&keep.port));
        assert!(!ports.contains(&drop.port));
        assert!(storage.project_holding_port(3002).await.is_none());
    }

    #[tokio::test]
    async fn sandbox_metadata_survives_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let project_id = {
            let storage = Storage::new(dir.path()).await.expect("storage");
            let project = storage
                .save_project(Project::new("meta", None, 3100))
                .await
                .expect("save");
            storage
                .set_sandbox_metadata(&project.id, SANDBOX_STATUS_INITIALIZED, "server up")
                .await
                .expect("metadata");
            storage
                .set_server_pid(&project.id, Some(4242))
                .await
                .expect("pid");
            project.id
        };

        let reopened = Storage::new(dir.path()).await.expect("reopen");
        let project = reopened.get_project(&project_id).await.expect("project");
        assert_eq!(project.server_pid, Some(4242));
        assert_eq!(
            project.metadata.get(SANDBOX_STATUS_KEY).and_then(Value::as_str),
            Some(SANDBOX_STATUS_INITIALIZED)
        );
        assert_eq!(
            project.metadata.get(SANDBOX_ERROR_KEY).and_then(Value::as_str),
            Some("server up")
        );
    }

    #[tokio::test]
    async fn sandbox_metadata_records_failures() {
        let (_dir, storage) = store().await;
        let project = storage
            .save_project(Project::new("broken", None, 3200))
            .await
            .expect("save");
        storage
            .set_sandbox_metadata(&project.id, SANDBOX_STATUS_FAILED, "bun not found")
            .await
            .expect("metadata");
        let project = storage.get_project(&project.id).await.expect("project");
        assert_eq!(
            project.metadata.get(SANDBOX_STATUS_KEY).and_then(Value::as_str),
            Some(SANDBOX_STATUS_FAILED)
        );
        assert!(project.server_pid.is_none());
    }

    #[tokio::test]
    async fn session_listing_filters_by_project_and_deletion() {
        let (_dir, storage) = store().await;
        let a = storage
            .save_session(Session::new("project-a", "first"))
            .await
            .expect("save");
        storage
            .save_session(Session::new("project-b", "other"))
            .await
            .expect("save");

        assert_eq!(storage.list_sessions(Some("project-a")).await.len(), 1);
        assert_eq!(storage.list_sessions(None).await.len(), 2);

        assert!(storage.soft_delete_session(&a.id).await.expect("delete"));
        assert!(storage.list_sessions(Some("project-a")).await.is_empty());
        assert!(storage.get_session(&a.id).await.is_none());
    }

    #[tokio::test]
    async fn append_messages_extends_transcript_in_order() {
        let (_dir, storage) = store().await;
        let session = storage
            .save_session(Session::new("project-a", "chat"))
            .await
            .expect("save");
        storage
            .append_messages(
                &session.id,
                vec![
                    ChatRecord::user("build a todo app"),
                    ChatRecord::assistant("done"),
                ],
            )
            .await
            .expect("append");

        let session = storage.get_session(&session.id).await.expect("session");
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, "user");
        assert_eq!(session.messages[1].content, "done");
    }
}
