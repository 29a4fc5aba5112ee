use std::sync::Arc;

use crate::{
    config::Config,
    error::Error,
    mailer::Mailer,
    scheduler::Scheduler,
    store::sqlite::SqliteStore,
    transport::Transport,
    worker::Deliverer,
};

/// Process-level wiring: one SQLite store plus the configuration every
/// component built from it shares.
pub struct Service {
    store: SqliteStore,
    config: Config,
}

impl Service {
    pub async fn connect() -> Result<Self, Error> {
        Self::connect_with(Config::default()).await
    }

    pub async fn connect_with(config: Config) -> Result<Self, Error> {
        let store = SqliteStore::connect(config.db_path()).await?;

        Ok(Self { store, config })
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mailer(&self) -> Mailer<SqliteStore> {
        Mailer::new(self.store.clone(), &self.config.delivery())
    }

    pub fn deliverer<T: Transport>(&self, transport: T) -> Deliverer<SqliteStore, T> {
        Deliverer::builder()
            .store(self.store.clone())
            .transport(transport)
            .config(self.config.delivery())
            .build()
    }

    pub fn scheduler<T: Transport>(&self, transport: T) -> Scheduler<SqliteStore, T> {
        Scheduler::new(
            Arc::new(self.deliverer(transport)),
            self.config.worker_id(),
            self.config.poll_interval(),
        )
    }
}
