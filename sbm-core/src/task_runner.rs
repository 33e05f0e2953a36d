//! Single-worker task queue plus a stuck-task reaper, modeled on the
//! teacher's background-processor tick loop but driven by DB-backed claim
//! semantics instead of LDK event futures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as Json;
use tracing::{debug, error, warn};
use uuid::Uuid;

use sbm_common::shutdown::ShutdownChannel;
use sbm_common::task::CoreTask;
use sbm_common::time::TimestampMillis;

use crate::model::{Task, TaskStatus, TaskType};
use crate::store::Store;

const WORKER_TICK: Duration = Duration::from_millis(800);

/// One OCR/parse job executor per [`TaskType`]; the task runner is agnostic
/// to what a task actually does.
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    async fn execute(&self, task: &Task) -> Result<Json, String>;
}

/// Idempotent submit: a matching `(type, created_by, target_id,
/// file_sha256)` row already `queued`/`processing` is returned unchanged;
/// otherwise a new row is inserted `queued`.
pub async fn create_task(
    store: &dyn Store,
    task_type: TaskType,
    created_by: Uuid,
    target_id: Uuid,
    file_sha256: Option<&str>,
) -> Result<Task, sbm_common::error::CoreError> {
    if let Some(existing) = store
        .find_task_idempotent(task_type, created_by, target_id, file_sha256)
        .await?
    {
        return Ok(existing);
    }
    let now = TimestampMillis::now();
    let task = Task {
        id: Uuid::new_v4(),
        task_type,
        status: TaskStatus::Queued,
        created_by,
        target_id,
        file_sha256: file_sha256.map(str::to_string),
        result_json: None,
        error: None,
        created_at: now,
        updated_at: now,
    };
    store.put_task(task.clone()).await?;
    Ok(task)
}

/// Cancel a task while it is still `queued`/`processing`; terminal tasks
/// reject cancellation.
pub async fn cancel_task(
    store: &dyn Store,
    id: Uuid,
) -> Result<bool, sbm_common::error::CoreError> {
    let Some(task) = store.get_task(id).await? else {
        return Ok(false);
    };
    if task.status.is_terminal() {
        return Ok(false);
    }
    store.update_task_status(id, task.status, TaskStatus::Canceled).await
}

/// Spawn the single worker task.
pub fn spawn_worker(
    store: Arc<dyn Store>,
    executors: Arc<dyn Fn(TaskType) -> Arc<dyn TaskExecutor> + Send + Sync>,
    mut shutdown: ShutdownChannel,
) -> CoreTask<()> {
    CoreTask::spawn(async move {
        let mut ticker = tokio::time::interval(WORKER_TICK);
        loop {
            tokio::select! {
                biased;
                () = shutdown.recv() => return,
                _ = ticker.tick() => {
                    if let Err(e) = run_one_tick(&store, &executors).await {
                        error!(error = %e, "task runner tick failed");
                    }
                }
            }
        }
    })
}

async fn run_one_tick(
    store: &Arc<dyn Store>,
    executors: &Arc<dyn Fn(TaskType) -> Arc<dyn TaskExecutor> + Send + Sync>,
) -> Result<(), sbm_common::error::CoreError> {
    let Some(task) = store.claim_next_queued_task().await? else {
        return Ok(());
    };

    let Some(fresh) = store.get_task(task.id).await? else {
        return Ok(());
    };
    if fresh.status == TaskStatus::Canceled {
        debug!(task_id = %task.id, "task canceled between claim and execute");
        return Ok(());
    }

    let executor = (executors)(task.task_type);
    match executor.execute(&task).await {
        Ok(result) => {
            let mut updated = task.clone();
            updated.result_json = Some(result);
            updated.updated_at = TimestampMillis::now();
            store.put_task(updated).await?;
            store
                .update_task_status(task.id, TaskStatus::Processing, TaskStatus::Succeeded)
                .await?;
        }
        Err(error) => {
            let mut updated = task.clone();
            updated.error = Some(error);
            updated.updated_at = TimestampMillis::now();
            store.put_task(updated).await?;
            store
                .update_task_status(task.id, TaskStatus::Processing, TaskStatus::Failed)
                .await?;
        }
    }
    Ok(())
}

/// Spawn the reaper: every `interval`, move `processing` rows older than
/// `ttl` to `failed`.
pub fn spawn_reaper(
    store: Arc<dyn Store>,
    interval: Duration,
    ttl: Duration,
    mut shutdown: ShutdownChannel,
) -> CoreTask<()> {
    CoreTask::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                biased;
                () = shutdown.recv() => return,
                _ = ticker.tick() => {
                    if let Err(e) = reap_stuck_tasks(&store, ttl).await {
                        warn!(error = %e, "task reaper tick failed");
                    }
                }
            }
        }
    })
}

async fn reap_stuck_tasks(
    store: &Arc<dyn Store>,
    ttl: Duration,
) -> Result<(), sbm_common::error::CoreError> {
    let threshold = TimestampMillis::now().as_i64() - ttl.as_millis() as i64;
    let stuck = store.list_stuck_processing_tasks(threshold).await?;
    for task in stuck {
        let mut updated = task.clone();
        updated.error = Some("task processing timeout".to_string());
        updated.updated_at = TimestampMillis::now();
        store.put_task(updated).await?;
        store
            .update_task_status(task.id, TaskStatus::Processing, TaskStatus::Failed)
            .await?;
    }
    Ok(())
}
