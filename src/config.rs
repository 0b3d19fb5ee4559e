use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::fetch::ImageBounds;

/// Runtime configuration. Every field has a default so an absent or partial
/// YAML file is fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cache_dir: PathBuf,
    /// Holds `library.json` and `tasks/`.
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,

    pub user_agent: String,
    pub fetch_timeout_secs: u64,

    pub image_max_width: u32,
    pub image_max_height: u32,
    pub stylesheet: Option<PathBuf>,

    /// How many ToC discovery tiers may be escalated through (1..=3).
    pub toc_tiers: u8,

    pub worker_concurrency: usize,
    pub retention_succeeded_days: i64,
    pub retention_failed_days: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("cache"),
            data_dir: PathBuf::from("var"),
            output_dir: PathBuf::from("var/epubs"),
            user_agent: format!("serialbook/{}", env!("CARGO_PKG_VERSION")),
            fetch_timeout_secs: 30,
            image_max_width: 1024,
            image_max_height: 1024,
            stylesheet: None,
            toc_tiers: 3,
            worker_concurrency: 2,
            retention_succeeded_days: 7,
            retention_failed_days: 30,
        }
    }
}

impl AppConfig {
    /// Load from `path` (or `SERIALBOOK_CONFIG`), then apply env overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let env_path = std::env::var_os("SERIALBOOK_CONFIG").map(PathBuf::from);
        let path = path.map(Path::to_path_buf).or(env_path);

        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("read config: {}", path.display()))?;
                serde_yaml::from_str::<AppConfig>(&raw)
                    .with_context(|| format!("parse config: {}", path.display()))?
            }
            None => AppConfig::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(dir) = env_path("SERIALBOOK_CACHE_DIR") {
            self.cache_dir = dir;
        }
        if let Some(dir) = env_path("SERIALBOOK_DATA_DIR") {
            self.data_dir = dir;
        }
        if let Some(dir) = env_path("SERIALBOOK_OUTPUT_DIR") {
            self.output_dir = dir;
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(1..=3).contains(&self.toc_tiers) {
            anyhow::bail!("toc_tiers must be between 1 and 3, got {}", self.toc_tiers);
        }
        if self.image_max_width == 0 || self.image_max_height == 0 {
            anyhow::bail!("image bounds must be non-zero");
        }
        if self.fetch_timeout_secs == 0 {
            anyhow::bail!("fetch_timeout_secs must be non-zero");
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn image_bounds(&self) -> ImageBounds {
        ImageBounds::new(self.image_max_width, self.image_max_height)
    }

    pub fn library_path(&self) -> PathBuf {
        self.data_dir.join("library.json")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.data_dir.join("tasks")
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    let raw = std::env::var(name).ok()?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    Some(PathBuf::from(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config: AppConfig =
            serde_yaml::from_str("cache_dir: /tmp/c\nimage_max_width: 600\n").unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/c"));
        assert_eq!(config.image_max_width, 600);
        assert_eq!(config.image_max_height, 1024);
        assert_eq!(config.fetch_timeout_secs, 30);
        assert_eq!(config.toc_tiers, 3);
    }

    #[test]
    fn validate_rejects_out_of_range_tiers() {
        let config = AppConfig {
            toc_tiers: 4,
            ..AppConfig::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("toc_tiers"));
    }
}
