//! Application state wiring the engine to its SQLite store.

use std::path::PathBuf;

use anyhow::Context;
use waypoint_core::automation::{Engine, Registry};
use waypoint_infra::config::{load_engine_config, resolve_data_dir, resolve_database_url};
use waypoint_infra::sqlite::automation::SqliteAutomationStore;
use waypoint_infra::sqlite::pool::DatabasePool;
use waypoint_types::config::EngineConfig;

use crate::demos;

/// The engine pinned to the SQLite store.
pub type ConcreteEngine = Engine<SqliteAutomationStore>;

/// Shared state for every CLI command.
#[derive(Clone)]
pub struct AppState {
    pub engine: ConcreteEngine,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Resolve the data directory, load `config.toml`, open the database and
    /// register the built-in workflows.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        let db_url = resolve_database_url(&config, &data_dir);
        let db_pool = DatabasePool::new(&db_url)
            .await
            .with_context(|| format!("failed to open database {db_url}"))?;

        Self::from_parts(data_dir, config, db_pool)
    }

    pub fn from_parts(
        data_dir: PathBuf,
        config: EngineConfig,
        db_pool: DatabasePool,
    ) -> anyhow::Result<Self> {
        let registry = Registry::new();
        demos::register_all(&registry).context("invalid built-in workflow definition")?;

        let engine = Engine::new(SqliteAutomationStore::new(db_pool), registry, config);
        tracing::debug!(data_dir = %data_dir.display(), "application state ready");
        Ok(Self { engine, data_dir })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_infra::sqlite::pool::database_url;

    #[tokio::test]
    async fn test_from_parts_registers_demos() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::new(&database_url(dir.path())).await.unwrap();
        let state = AppState::from_parts(dir.path().to_path_buf(), EngineConfig::default(), pool).unwrap();

        let classes: Vec<String> = state
            .engine
            .registry()
            .classes()
            .into_iter()
            .map(|(class, _)| class)
            .collect();
        assert_eq!(classes, [demos::HEARTBEAT, demos::ONBOARDING]);
    }
}
