use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::export::ExportSettings;
use crate::fetch::ImageBounds;
use crate::store::BookId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    Ingest {
        url: String,
    },
    Fill {
        book_id: BookId,
        limit: Option<usize>,
    },
    Export {
        book_id: BookId,
        #[serde(default)]
        overrides: ExportOverrides,
    },
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Ingest { .. } => "ingest",
            TaskKind::Fill { .. } => "fill",
            TaskKind::Export { .. } => "export",
        }
    }
}

/// Per-job export choices. Anything left unset falls back to the stored book
/// metadata or the configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExportOverrides {
    pub title: Option<String>,
    pub author: Option<String>,
    pub language: Option<String>,
    pub cover: Option<String>,
    pub include_images: Option<bool>,
    pub include_chapter_titles: Option<bool>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub stylesheet: Option<PathBuf>,
}

impl ExportOverrides {
    /// Rejects zero image bounds, which would otherwise reach the resizer.
    pub fn to_settings(&self, config: &AppConfig) -> anyhow::Result<ExportSettings> {
        if self.max_width == Some(0) || self.max_height == Some(0) {
            anyhow::bail!("image bounds must be non-zero");
        }
        let defaults = ExportSettings::default();
        Ok(ExportSettings {
            title: self.title.clone(),
            author: self.author.clone(),
            language: self.language.clone(),
            cover: self.cover.clone(),
            include_images: self.include_images.unwrap_or(defaults.include_images),
            include_chapter_titles: self
                .include_chapter_titles
                .unwrap_or(defaults.include_chapter_titles),
            image_bounds: ImageBounds::new(
                self.max_width.unwrap_or(config.image_max_width),
                self.max_height.unwrap_or(config.image_max_height),
            ),
            stylesheet: self.stylesheet.clone().or_else(|| config.stylesheet.clone()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub attempts: u32,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    pub error: Option<String>,
    pub output_path: Option<PathBuf>,
}

impl Task {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().simple().to_string(),
            kind,
            status: TaskStatus::Queued,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            output_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_fall_back_to_config() {
        let config = AppConfig {
            image_max_width: 640,
            stylesheet: Some(PathBuf::from("base.css")),
            ..AppConfig::default()
        };
        let settings = ExportOverrides {
            author: Some("Me".to_string()),
            include_chapter_titles: Some(true),
            max_height: Some(480),
            ..ExportOverrides::default()
        }
        .to_settings(&config)
        .unwrap();

        assert_eq!(settings.author.as_deref(), Some("Me"));
        assert!(settings.title.is_none());
        assert!(settings.include_images);
        assert!(settings.include_chapter_titles);
        assert_eq!(settings.image_bounds, ImageBounds::new(640, 480));
        assert_eq!(settings.stylesheet, Some(PathBuf::from("base.css")));
    }

    #[test]
    fn zero_image_bounds_are_rejected() {
        let config = AppConfig::default();
        for overrides in [
            ExportOverrides {
                max_width: Some(0),
                ..ExportOverrides::default()
            },
            ExportOverrides {
                max_height: Some(0),
                ..ExportOverrides::default()
            },
        ] {
            let err = overrides.to_settings(&config).unwrap_err();
            assert!(err.to_string().contains("non-zero"), "{err}");
        }
    }

    #[test]
    fn task_kind_is_tagged_json() {
        let task = Task::new(TaskKind::Fill {
            book_id: 3,
            limit: Some(10),
        });
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["kind"]["type"], "fill");
        assert_eq!(json["status"], "queued");

        let back: Task = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind, task.kind);
    }
}
