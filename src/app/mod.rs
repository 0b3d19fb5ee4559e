//! Task plumbing: persisted task records, a runner that drives the library
//! operations, a bounded in-process queue and retention cleanup.

pub mod cleanup;
pub mod model;
pub mod queue;
pub mod runner;
pub mod task_store;

use std::sync::Arc;

use anyhow::Context as _;

use crate::cache::ContentCache;
use crate::config::AppConfig;
use crate::fetch::{Fetcher, HttpTransport};
use crate::provider::ProviderRegistry;
use crate::store::{BookStore, LocalFsBookStore};

/// Everything an operation needs, wired from configuration once.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<AppConfig>,
    pub library: Arc<dyn BookStore>,
    pub fetcher: Arc<Fetcher>,
    pub registry: Arc<ProviderRegistry>,
}

impl Services {
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let transport = HttpTransport::new(&config.user_agent, config.fetch_timeout())
            .context("build http transport")?;
        let fetcher = Fetcher::new(ContentCache::new(config.cache_dir.clone()), Arc::new(transport));
        let registry = ProviderRegistry::builtin(config.toc_tiers).context("build providers")?;
        let library = LocalFsBookStore::new(config.library_path());

        Ok(Self {
            config: Arc::new(config),
            library: Arc::new(library),
            fetcher: Arc::new(fetcher),
            registry: Arc::new(registry),
        })
    }
}
