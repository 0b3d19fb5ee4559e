use anyhow::Context as _;
use chrono::{DateTime, Duration, Utc};

use crate::app::model::{Task, TaskKind, TaskStatus};
use crate::app::task_store::TaskStore;
use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub artifacts_removed: usize,
}

/// How long a task in `status` is kept after it finished. Unfinished tasks
/// are never expired.
pub fn retention_for(status: TaskStatus, config: &AppConfig) -> Option<Duration> {
    match status {
        TaskStatus::Succeeded => Some(Duration::days(config.retention_succeeded_days)),
        TaskStatus::Failed => Some(Duration::days(config.retention_failed_days)),
        TaskStatus::Queued | TaskStatus::Running => None,
    }
}

fn is_expired(task: &Task, config: &AppConfig, now: DateTime<Utc>) -> bool {
    let Some(retention) = retention_for(task.status, config) else {
        return false;
    };
    let finished = task.finished_at.unwrap_or(task.created_at);
    now - finished > retention
}

/// Delete finished tasks past their retention, together with the EPUB an
/// export task produced.
pub fn cleanup_expired_tasks(
    task_store: &dyn TaskStore,
    config: &AppConfig,
    now: DateTime<Utc>,
) -> anyhow::Result<CleanupReport> {
    let mut report = CleanupReport::default();
    for task in task_store.list().context("list tasks")? {
        if !is_expired(&task, config, now) {
            continue;
        }

        if let (TaskKind::Export { .. }, Some(path)) = (&task.kind, &task.output_path) {
            match std::fs::remove_file(path) {
                Ok(()) => report.artifacts_removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(task_id = %task.task_id, path = %path.display(), %err, "could not remove export artifact");
                }
            }
        }

        if task_store
            .delete(&task.task_id)
            .with_context(|| format!("delete task {}", task.task_id))?
        {
            report.deleted += 1;
        }
    }

    tracing::info!(
        deleted = report.deleted,
        artifacts_removed = report.artifacts_removed,
        "task cleanup finished"
    );
    Ok(report)
}
