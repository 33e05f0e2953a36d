//! The active-connections registry: `email_config_id -> connection handle`.
//! Reads (status checks) take a read lock; start/stop take a write lock but
//! perform their network I/O only after releasing it, per the concurrency
//! model's locking discipline.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use sbm_common::shutdown::ShutdownChannel;
use sbm_common::task::CoreTask;

struct Handle {
    shutdown: ShutdownChannel,
    task: CoreTask<()>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    handles: RwLock<HashMap<Uuid, Handle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_monitoring(&self, config_id: Uuid) -> bool {
        self.handles.read().await.contains_key(&config_id)
    }

    /// Register a freshly spawned connection's handle. Replaces (and stops)
    /// any previous handle for the same config.
    pub async fn start(&self, config_id: Uuid, shutdown: ShutdownChannel, task: CoreTask<()>) {
        let previous = {
            let mut handles = self.handles.write().await;
            handles.insert(config_id, Handle { shutdown, task })
        };
        if let Some(previous) = previous {
            // Network I/O (waiting for the old task to unwind) happens after
            // the write lock above has already been released.
            previous.shutdown.send();
            let _ = previous.task.await;
        }
    }

    /// Stop the connection for `config_id`, if any is running.
    pub async fn stop(&self, config_id: Uuid) {
        let removed = {
            let mut handles = self.handles.write().await;
            handles.remove(&config_id)
        };
        if let Some(handle) = removed {
            handle.shutdown.send();
            let _ = handle.task.await;
        }
    }

    pub async fn active_config_ids(&self) -> Vec<Uuid> {
        self.handles.read().await.keys().copied().collect()
    }
}

pub type SharedRegistry = Arc<ConnectionRegistry>;

#[cfg(test)]
mod test {
    use super::*;

    /// A handle that runs until its shutdown channel fires, mirroring the
    /// real IMAP worker's loop shape without any actual I/O.
    fn spawn_until_shutdown() -> (ShutdownChannel, CoreTask<()>) {
        let shutdown = ShutdownChannel::new();
        let watcher = shutdown.clone();
        let task = CoreTask::spawn(async move { watcher.recv().await });
        (shutdown, task)
    }

    #[tokio::test]
    async fn start_then_stop_removes_from_registry() {
        let registry = ConnectionRegistry::new();
        let config_id = Uuid::new_v4();
        let (shutdown, task) = spawn_until_shutdown();

        registry.start(config_id, shutdown, task).await;
        assert!(registry.is_monitoring(config_id).await);

        registry.stop(config_id).await;
        assert!(!registry.is_monitoring(config_id).await);
    }

    #[tokio::test]
    async fn starting_twice_stops_the_previous_handle() {
        let registry = ConnectionRegistry::new();
        let config_id = Uuid::new_v4();

        let (shutdown1, task1) = spawn_until_shutdown();
        registry.start(config_id, shutdown1.clone(), task1).await;

        let (shutdown2, task2) = spawn_until_shutdown();
        registry.start(config_id, shutdown2, task2).await;

        assert!(shutdown1.try_recv());
        assert_eq!(registry.active_config_ids().await, vec![config_id]);
    }
}
