use std::path::{Path, PathBuf};

use anyhow::Context as _;

use crate::app::model::Task;
use crate::store::write_json_atomic;

pub trait TaskStore: Send + Sync {
    fn create(&self, task: &Task) -> anyhow::Result<()>;
    fn get(&self, task_id: &str) -> anyhow::Result<Option<Task>>;
    fn put(&self, task: &Task) -> anyhow::Result<()>;
    /// All tasks, oldest first.
    fn list(&self) -> anyhow::Result<Vec<Task>>;
    /// Returns whether a record was removed.
    fn delete(&self, task_id: &str) -> anyhow::Result<bool>;
}

/// One JSON file per task under `base_dir`.
#[derive(Debug, Clone)]
pub struct LocalFsTaskStore {
    base_dir: PathBuf,
}

impl LocalFsTaskStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn task_json_path(&self, task_id: &str) -> PathBuf {
        self.base_dir.join(format!("{task_id}.json"))
    }
}

impl TaskStore for LocalFsTaskStore {
    fn create(&self, task: &Task) -> anyhow::Result<()> {
        let path = self.task_json_path(&task.task_id);
        if path.exists() {
            anyhow::bail!("task already exists: {}", task.task_id);
        }
        write_json_atomic(&path, task).context("write task json")?;
        Ok(())
    }

    fn get(&self, task_id: &str) -> anyhow::Result<Option<Task>> {
        let path = self.task_json_path(task_id);
        read_json(&path).with_context(|| format!("read: {}", path.display()))
    }

    fn put(&self, task: &Task) -> anyhow::Result<()> {
        write_json_atomic(&self.task_json_path(&task.task_id), task).context("write task json")?;
        Ok(())
    }

    fn list(&self) -> anyhow::Result<Vec<Task>> {
        let entries = match std::fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("list tasks: {}", self.base_dir.display()));
            }
        };

        let mut tasks = Vec::new();
        for entry in entries {
            let path = entry.context("read task dir entry")?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match read_json::<Task>(&path) {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(path = %path.display(), err = %format!("{err:#}"), "skipping unreadable task record");
                }
            }
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.task_id.cmp(&b.task_id)));
        Ok(tasks)
    }

    fn delete(&self, task_id: &str) -> anyhow::Result<bool> {
        let path = self.task_json_path(task_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("delete: {}", path.display())),
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value = serde_json::from_slice(&bytes).context("parse json")?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::model::{TaskKind, TaskStatus};

    #[test]
    fn create_get_put_list_delete() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LocalFsTaskStore::new(dir.path().join("tasks"));
        assert!(store.list().unwrap().is_empty());

        let mut task = Task::new(TaskKind::Ingest {
            url: "https://rr.test/fiction/1".to_string(),
        });
        store.create(&task).unwrap();
        assert!(store.create(&task).is_err());

        task.status = TaskStatus::Running;
        task.attempts = 1;
        store.put(&task).unwrap();

        let loaded = store.get(&task.task_id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);
        assert_eq!(loaded.attempts, 1);
        assert_eq!(store.list().unwrap().len(), 1);

        assert!(store.delete(&task.task_id).unwrap());
        assert!(!store.delete(&task.task_id).unwrap());
        assert!(store.get(&task.task_id).unwrap().is_none());
    }

    #[test]
    fn list_skips_corrupt_records() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LocalFsTaskStore::new(dir.path());
        store
            .create(&Task::new(TaskKind::Fill {
                book_id: 1,
                limit: None,
            }))
            .unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        assert_eq!(store.list().unwrap().len(), 1);
    }
}
