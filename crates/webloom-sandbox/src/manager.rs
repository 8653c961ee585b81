use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::sleep;

use webloom_types::SandboxOutcome;

use crate::SandboxSettings;

/// Materializes a project's sandbox directory from templates and launches
/// its server as a detached subprocess. Setup never raises past this
/// boundary: every failure is folded into `SandboxOutcome::Failed`.
pub struct SandboxManager {
    settings: SandboxSettings,
}

impl SandboxManager {
    pub fn new(settings: SandboxSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.settings.root.join("projects").join(project_id)
    }

    pub async fn setup(&self, project_id: &str, port: u16) -> SandboxOutcome {
        match self.try_setup(project_id, port).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(project_id, error = %err, "sandbox setup failed");
                SandboxOutcome::Failed {
                    message: format!("Error setting up sandbox: {err}"),
                }
            }
        }
    }

    async fn try_setup(&self, project_id: &str, port: u16) -> anyhow::Result<SandboxOutcome> {
        let project_dir = self.project_dir(project_id);
        fs::create_dir_all(&project_dir).await?;

        tracing::info!(project_id, port, "preparing sandbox from templates");

        let manifest = fs::read_to_string(self.settings.templates_dir.join("package.json")).await?;
        fs::write(project_dir.join("package.json"), manifest).await?;

        let entry = fs::read_to_string(self.settings.templates_dir.join("server.js"))
            .await?
            .replace("{PORT}", &port.to_string());
        fs::write(project_dir.join("server.js"), entry).await?;

        let page = fs::read_to_string(self.settings.templates_dir.join("index.html")).await?;
        fs::write(project_dir.join("index.html"), page).await?;

        tracing::info!(project_id, "starting sandbox server in background");
        let mut command = Command::new(&self.settings.runtime_command);
        command
            .args(&self.settings.runtime_args)
            .current_dir(&project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group: the server must outlive the request that spawned it.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        let Some(pid) = child.id() else {
            anyhow::bail!("sandbox process exited before a pid could be observed");
        };
        tracing::info!(project_id, pid, "sandbox server process created");

        // Liveness heuristic: long enough to catch a bad manifest, a port
        // conflict, or a missing runtime without blocking the caller.
        sleep(Duration::from_millis(self.settings.startup_probe_ms)).await;

        if child.try_wait()?.is_some() {
            let mut stderr_text = String::new();
            if let Some(mut stderr) = child.stderr.take() {
                let _ = stderr.read_to_string(&mut stderr_text).await;
            }
            let _ = child.wait().await;
            let detail = if stderr_text.trim().is_empty() {
                "process exited during startup".to_string()
            } else {
                stderr_text.trim().to_string()
            };
            tracing::error!(project_id, pid, %detail, "sandbox server failed to start");
            return Ok(SandboxOutcome::Failed {
                message: format!("Error starting server: {detail}"),
            });
        }

        let message = format!(
            "Sandbox setup complete! Server running at http://localhost:{port}, PID: {pid}"
        );
        tracing::info!(project_id, pid, port, "{message}");
        Ok(SandboxOutcome::Started { pid, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager_with_templates(
        runtime_command: &str,
        runtime_args: &[&str],
        probe_ms: u64,
    ) -> (tempfile::TempDir, SandboxManager) {
        let dir = tempfile::tempdir().expect("tempdir");
        let templates = dir.path().join("templates");
        std::fs::create_dir_all(&templates).expect("mkdir");
        std::fs::write(templates.join("package.json"), "{\"name\":\"sandbox\"}").expect("write");
        std::fs::write(templates.join("server.js"), "serve({PORT});").expect("write");
        std::fs::write(templates.join("index.html"), "<h1>Welcome</h1>").expect("write");

        let settings = SandboxSettings {
            root: dir.path().to_path_buf(),
            templates_dir: templates,
            startup_probe_ms: probe_ms,
            runtime_command: runtime_command.to_string(),
            runtime_args: runtime_args.iter().map(|s| s.to_string()).collect(),
            ..SandboxSettings::default()
        };
        (dir, SandboxManager::new(settings))
    }

    #[tokio::test]
    async fn templates_are_copied_with_port_substituted() {
        let (dir, manager) = manager_with_templates("sh", &["-c", "sleep 30"], 50).await;
        let outcome = manager.setup("proj-1", 3456).await;
        let pid = outcome.pid().expect("server should be running");

        let entry = std::fs::read_to_string(dir.path().join("projects/proj-1/server.js"))
            .expect("server.js");
        assert_eq!(entry, "serve(3456);");
        assert!(dir.path().join("projects/proj-1/package.json").exists());
        assert!(dir.path().join("projects/proj-1/index.html").exists());
        assert!(outcome.message().contains("http://localhost:3456"));

        let _ = crate::stop_server_with_settle(pid, Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn fast_exit_is_reported_with_drained_stderr() {
        let (_dir, manager) =
            manager_with_templates("sh", &["-c", "echo 'port already bound' >&2; exit 1"], 50)
                .await;
        let outcome = manager.setup("proj-2", 3456).await;
        assert!(outcome.pid().is_none());
        assert!(outcome.message().contains("port already bound"));
    }

    #[tokio::test]
    async fn missing_runtime_folds_into_a_failed_outcome() {
        let (_dir, manager) =
            manager_with_templates("webloom-no-such-runtime", &[], 50).await;
        let outcome = manager.setup("proj-3", 3456).await;
        match outcome {
            SandboxOutcome::Failed { message } => {
                assert!(message.starts_with("Error setting up sandbox:"));
            }
            SandboxOutcome::Started { .. } => panic!("spawn of a missing runtime cannot succeed"),
        }
    }

    #[tokio::test]
    async fn missing_templates_fold_into_a_failed_outcome() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = SandboxSettings {
            root: dir.path().to_path_buf(),
            templates_dir: dir.path().join("absent"),
            startup_probe_ms: 10,
            ..SandboxSettings::default()
        };
        let manager = SandboxManager::new(settings);
        let outcome = manager.setup("proj-4", 3456).await;
        assert!(outcome.pid().is_none());
    }
}
