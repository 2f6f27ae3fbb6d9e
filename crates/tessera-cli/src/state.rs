//! Application state wiring the engine to its SQLite store and catalog.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tessera_core::workflow::Engine;
use tessera_infra::catalog::DirectoryCatalog;
use tessera_infra::config::{load_engine_config, resolve_data_dir};
use tessera_infra::executor::LocalActionExecutor;
use tessera_infra::runtime::LocalRuntime;
use tessera_infra::sqlite::{DatabasePool, SqliteExecutionStore, default_database_url};
use tessera_types::config::EngineConfig;

pub type ConcreteEngine = Engine<SqliteExecutionStore, LocalActionExecutor>;

pub struct AppState {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
    pub db_pool: DatabasePool,
    /// Definitions from `{data_dir}/workflows`, plus any file passed to `run`.
    pub catalog: Arc<DirectoryCatalog>,
}

impl AppState {
    /// Resolve the data dir, load config and definitions, open the database.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        let catalog = DirectoryCatalog::load(&data_dir.join("workflows"))
            .await
            .context("Failed to load workflow definitions")?;

        let db_url = default_database_url(&data_dir);
        let db_pool = DatabasePool::new(&db_url)
            .await
            .with_context(|| format!("Failed to open database {db_url}"))?;
        tracing::debug!(data_dir = %data_dir.display(), workflows = catalog.len(), "application state ready");

        Ok(Self {
            data_dir,
            config,
            db_pool,
            catalog: Arc::new(catalog),
        })
    }

    fn store(&self) -> SqliteExecutionStore {
        SqliteExecutionStore::new(self.db_pool.clone())
    }

    /// Engine with a running completion listener and delayed-call poller.
    pub fn runtime(&self) -> LocalRuntime<SqliteExecutionStore> {
        LocalRuntime::start(self.store(), self.catalog.clone(), self.config.clone())
    }

    /// Engine without workers, for commands that never dispatch actions.
    pub fn engine(&self) -> ConcreteEngine {
        let (executor, _completions) = LocalActionExecutor::channel(1);
        Engine::new(self.store(), executor, self.catalog.clone(), self.config.clone())
    }
}
