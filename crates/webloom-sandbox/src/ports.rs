use std::sync::Arc;

use rand::Rng;

use webloom_storage::Storage;

const MAX_ATTEMPTS: usize = 100;

/// Collision-avoiding port picker. Draws random candidates against the set
/// of ports held by non-deleted projects; it does not reserve anything, so
/// the caller re-checks the winner before committing it.
pub struct PortAllocator {
    storage: Arc<Storage>,
    min_port: u16,
    max_port: u16,
}

impl PortAllocator {
    pub fn new(storage: Arc<Storage>, min_port: u16, max_port: u16) -> Self {
        Self {
            storage,
            min_port,
            max_port,
        }
    }

    pub async fn generate_available_port(&self) -> Option<u16> {
        let used_ports = self.storage.used_ports().await;
        tracing::info!(count = used_ports.len(), "ports already in use");

        let mut rng = rand::thread_rng();
        for _ in 0..MAX_ATTEMPTS {
            let port = rng.gen_range(self.min_port..=self.max_port);
            if !used_ports.contains(&port) {
                tracing::info!(port, "generated available port");
                return Some(port);
            }
        }

        tracing::error!(
            attempts = MAX_ATTEMPTS,
            "could not find available port within retry budget"
        );
        None
    }

    /// Direct existence check, independent of the randomized draw.
    pub async fn is_port_available(&self, port: u16) -> bool {
        let available = self.storage.project_holding_port(port).await.is_none();
        tracing::info!(
            port,
            available,
            "port availability checked"
        );
        available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webloom_types::Project;

    async fn storage_with_ports(ports: &[u16]) -> (tempfile::TempDir, Arc<Storage>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::new(dir.path()).await.expect("storage");
        for (idx, port) in ports.iter().enumerate() {
            storage
                .save_project(Project::new(format!("p{idx}"), None, *port))
                .await
                .expect("save");
        }
        (dir, Arc::new(storage))
    }

    #[tokio::test]
    async fn never_returns_a_port_held_by_a_live_project() {
        let (_dir, storage) = storage_with_ports(&[3000, 3001, 3002]).await;
        let allocator = PortAllocator::new(storage, 3000, 3003);
        for _ in 0..20 {
            let port = allocator
                .generate_available_port()
                .await
                .expect("a free port exists");
            assert_eq!(port, 3003);
        }
    }

    #[tokio::test]
    async fn exhausted_single_port_range_fails_within_budget() {
        let (_dir, storage) = storage_with_ports(&[3000]).await;
        let allocator = PortAllocator::new(storage, 3000, 3000);
        assert_eq!(allocator.generate_available_port().await, None);
    }

    #[tokio::test]
    async fn availability_check_ignores_deleted_projects() {
        let (_dir, storage) = storage_with_ports(&[]).await;
        let project = storage
            .save_project(Project::new("gone", None, 3500))
            .await
            .expect("save");
        let allocator = PortAllocator::new(storage.clone(), 3000, 4000);

        assert!(!allocator.is_port_available(3500).await);
        storage
            .soft_delete_project(&project.id)
            .await
            .expect("delete");
        assert!(allocator.is_port_available(3500).await);
    }
}
