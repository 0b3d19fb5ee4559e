use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;
use url::Url;

use crate::app::Services;
use crate::app::model::{Task, TaskKind, TaskStatus};
use crate::app::task_store::TaskStore;
use crate::fetch::FetchOptions;

pub struct TaskRunner {
    task_store: Arc<dyn TaskStore>,
    services: Services,
}

impl TaskRunner {
    pub fn new(task_store: Arc<dyn TaskStore>, services: Services) -> Self {
        Self {
            task_store,
            services,
        }
    }

    pub fn task_store(&self) -> &Arc<dyn TaskStore> {
        &self.task_store
    }

    /// Record a new queued task.
    pub fn submit(&self, kind: TaskKind) -> anyhow::Result<Task> {
        let task = Task::new(kind);
        self.task_store.create(&task).context("create task")?;
        tracing::info!(task_id = %task.task_id, kind = task.kind.label(), "task queued");
        Ok(task)
    }

    /// Ids of every task still waiting to run, oldest first.
    pub fn queued_task_ids(&self) -> anyhow::Result<Vec<String>> {
        Ok(self
            .task_store
            .list()
            .context("list tasks")?
            .into_iter()
            .filter(|task| task.status == TaskStatus::Queued)
            .map(|task| task.task_id)
            .collect())
    }

    /// Run one queued task to completion. Failures end up on the task record.
    pub fn run_task(&self, task_id: &str) {
        if let Err(err) = self.try_run_task(task_id) {
            tracing::error!(task_id, err = %format!("{err:#}"), "task failed");
            if let Err(mark_err) = self.mark_failed(task_id, format!("{err:#}")) {
                tracing::error!(task_id, err = %format!("{mark_err:#}"), "could not record task failure");
            }
        }
    }

    fn try_run_task(&self, task_id: &str) -> anyhow::Result<()> {
        let mut task = self
            .task_store
            .get(task_id)
            .context("load task")?
            .ok_or_else(|| anyhow::anyhow!("task not found: {task_id}"))?;
        if task.status != TaskStatus::Queued {
            tracing::debug!(task_id, status = ?task.status, "task is not queued; skipping");
            return Ok(());
        }

        self.mark_running(&mut task).context("mark running")?;
        task.output_path = self.execute(&task)?;

        task.status = TaskStatus::Succeeded;
        task.error = None;
        task.finished_at = Some(Utc::now());
        self.task_store.put(&task).context("save task")?;
        tracing::info!(task_id, kind = task.kind.label(), "task succeeded");
        Ok(())
    }

    fn mark_running(&self, task: &mut Task) -> anyhow::Result<()> {
        task.status = TaskStatus::Running;
        task.attempts += 1;
        task.started_at = Some(Utc::now());
        self.task_store.put(task).context("save task")?;
        Ok(())
    }

    fn mark_failed(&self, task_id: &str, message: String) -> anyhow::Result<()> {
        let Some(mut task) = self.task_store.get(task_id)? else {
            return Ok(());
        };
        task.status = TaskStatus::Failed;
        task.error = Some(message);
        task.finished_at = Some(Utc::now());
        self.task_store.put(&task)?;
        Ok(())
    }

    /// Returns the artifact path for tasks that produce one.
    fn execute(&self, task: &Task) -> anyhow::Result<Option<PathBuf>> {
        let Services {
            config,
            library,
            fetcher,
            registry,
        } = &self.services;

        match &task.kind {
            TaskKind::Ingest { url } => {
                let url = Url::parse(url).with_context(|| format!("parse fiction url: {url}"))?;
                let provider = registry.for_url(&url).context("select provider")?;
                crate::ingest::ingest_fiction(
                    library.as_ref(),
                    fetcher,
                    provider,
                    &url,
                    &FetchOptions::default(),
                )
                .context("ingest")?;
                Ok(None)
            }
            TaskKind::Fill { book_id, limit } => {
                crate::fill::fill_missing_content(
                    library.as_ref(),
                    fetcher,
                    registry,
                    *book_id,
                    *limit,
                )
                .context("fill")?;
                Ok(None)
            }
            TaskKind::Export { book_id, overrides } => {
                let out = export_output_path(&config.output_dir, &task.task_id);
                let settings = overrides.to_settings(config).context("export options")?;
                crate::export::export_book(
                    library.as_ref(),
                    fetcher,
                    registry,
                    *book_id,
                    &settings,
                    &out,
                )
                .context("export")?;
                Ok(Some(out))
            }
        }
    }
}

pub fn export_output_path(output_dir: &Path, task_id: &str) -> PathBuf {
    output_dir.join(format!("{task_id}.epub"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::model::ExportOverrides;
    use crate::app::task_store::LocalFsTaskStore;
    use crate::config::AppConfig;
    use crate::fetch::tests::{FakeTransport, fetcher_with};
    use crate::provider::ProviderRegistry;
    use crate::store::{BookStore, ChapterFilter, MemoryBookStore};

    const FICTION: &str = "https://rr.test/fiction/8/quest";

    fn transport() -> FakeTransport {
        FakeTransport::default()
            .with(
                FICTION,
                r#"<html><body><div class="fic-header"><h1>Quest</h1></div>
                   <div id="chapters">
                     <a href="/fiction/8/quest/chapter/81/a">One</a>
                     <a href="/fiction/8/quest/chapter/82/b">Two</a>
                   </div></body></html>"#,
            )
            .with(
                "https://rr.test/fiction/8/quest/chapter/81/a",
                "<html><body><div class=\"chapter-inner\"><p>first</p></div></body></html>",
            )
    }

    struct Fixture {
        dir: tempfile::TempDir,
        library: Arc<MemoryBookStore>,
        runner: TaskRunner,
    }

    fn setup() -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let (fetcher, _) = fetcher_with(&dir.path().join("cache"), transport());
        let library = Arc::new(MemoryBookStore::new());
        let config = AppConfig {
            output_dir: dir.path().join("out"),
            ..AppConfig::default()
        };
        let services = Services {
            config: Arc::new(config),
            library: library.clone(),
            fetcher: Arc::new(fetcher),
            registry: Arc::new(ProviderRegistry::builtin(3).unwrap()),
        };
        let tasks = Arc::new(LocalFsTaskStore::new(dir.path().join("tasks")));
        Fixture {
            runner: TaskRunner::new(tasks, services),
            library,
            dir,
        }
    }

    #[test]
    fn ingest_then_export_succeeds_with_partial_content() {
        let Fixture {
            dir,
            library,
            runner,
        } = setup();

        let ingest = runner
            .submit(TaskKind::Ingest {
                url: FICTION.to_string(),
            })
            .unwrap();
        runner.run_task(&ingest.task_id);
        let ingest = runner.task_store().get(&ingest.task_id).unwrap().unwrap();
        assert_eq!(ingest.status, TaskStatus::Succeeded);
        assert_eq!(ingest.attempts, 1);
        assert!(ingest.started_at.is_some() && ingest.finished_at.is_some());

        let book = library.list_books().unwrap().remove(0);
        let export = runner
            .submit(TaskKind::Export {
                book_id: book.id,
                overrides: ExportOverrides {
                    title: Some("Custom".to_string()),
                    ..ExportOverrides::default()
                },
            })
            .unwrap();
        runner.run_task(&export.task_id);

        let export = runner.task_store().get(&export.task_id).unwrap().unwrap();
        assert_eq!(export.status, TaskStatus::Succeeded, "{:?}", export.error);
        let out = export.output_path.unwrap();
        assert_eq!(out, dir.path().join("out").join(format!("{}.epub", export.task_id)));
        assert!(out.exists());
        assert_eq!(library.count_chapters(book.id, ChapterFilter::Missing).unwrap(), 1);
    }

    #[test]
    fn failure_is_recorded_with_its_cause() {
        let Fixture { runner, dir: _dir, .. } = setup();
        let task = runner
            .submit(TaskKind::Fill {
                book_id: 404,
                limit: None,
            })
            .unwrap();
        runner.run_task(&task.task_id);

        let task = runner.task_store().get(&task.task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let error = task.error.unwrap();
        assert!(error.starts_with("fill"), "{error}");
        assert!(error.contains("404"), "{error}");
    }

    #[test]
    fn zero_image_bound_fails_the_export_task() {
        let Fixture { runner, dir: _dir, .. } = setup();
        let task = runner
            .submit(TaskKind::Export {
                book_id: 1,
                overrides: ExportOverrides {
                    max_width: Some(0),
                    ..ExportOverrides::default()
                },
            })
            .unwrap();
        runner.run_task(&task.task_id);

        let task = runner.task_store().get(&task.task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let error = task.error.unwrap();
        assert!(error.contains("non-zero"), "{error}");
        assert!(task.output_path.is_none());
    }

    #[test]
    fn finished_tasks_are_not_rerun() {
        let Fixture { runner, dir: _dir, .. } = setup();
        let task = runner
            .submit(TaskKind::Ingest {
                url: "https://elsewhere.test/story/1".to_string(),
            })
            .unwrap();
        runner.run_task(&task.task_id);
        runner.run_task(&task.task_id);

        let task = runner.task_store().get(&task.task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 1);
        assert!(runner.queued_task_ids().unwrap().is_empty());
    }
}
