use std::time::Duration;

use serde::Deserialize;

use crate::worker::DeliveryConfig;

/// Process configuration, read from `COURIER_`-prefixed environment variables.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_stale_lock_secs")]
    pub stale_lock_secs: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    pub worker_id: Option<String>,
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_batch_size() -> usize {
    20
}

fn default_max_attempts() -> u32 {
    3
}

fn default_stale_lock_secs() -> u64 {
    300
}

fn default_send_timeout_ms() -> u64 {
    30_000
}

fn default_store_timeout_ms() -> u64 {
    5_000
}

fn default_concurrency() -> usize {
    8
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Builds a config from an explicit set of variables. Keys must carry the
    /// `COURIER_` prefix, exactly as they would in the environment.
    pub fn from_vars<I>(vars: I) -> eyre::Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config = envy::prefixed("COURIER_").from_iter::<_, Self>(vars)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> eyre::Result<()> {
        if self.batch_size == 0 {
            eyre::bail!("COURIER_BATCH_SIZE must be at least 1");
        }
        if self.max_attempts == 0 {
            eyre::bail!("COURIER_MAX_ATTEMPTS must be at least 1");
        }
        if self.concurrency == 0 {
            eyre::bail!("COURIER_CONCURRENCY must be at least 1");
        }

        // A claim must outlive the longest a cycle can hold it, or another
        // worker takes it over while the owner is still sending.
        let delivery = self.delivery();
        if delivery.max_hold() >= delivery.stale_lock_threshold {
            eyre::bail!(
                "COURIER_STALE_LOCK_SECS ({:?}) must exceed the longest a cycle can hold a claim ({:?}); \
                 lower the batch size or timeouts, or raise concurrency",
                delivery.stale_lock_threshold,
                delivery.max_hold()
            );
        }

        Ok(())
    }

    pub fn db_path(&self) -> Option<&str> {
        self.db_path.as_deref()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Identifier written into `locked_by`. Only used for attribution, but it
    /// should differ between live processes.
    pub fn worker_id(&self) -> String {
        match &self.worker_id {
            Some(id) => id.clone(),
            None => {
                let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned());
                format!("{host}-{}", std::process::id())
            }
        }
    }

    pub fn delivery(&self) -> DeliveryConfig {
        DeliveryConfig {
            batch_size: self.batch_size,
            max_attempts: self.max_attempts,
            stale_lock_threshold: Duration::from_secs(self.stale_lock_secs),
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            concurrency: self.concurrency,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            stale_lock_secs: default_stale_lock_secs(),
            send_timeout_ms: default_send_timeout_ms(),
            store_timeout_ms: default_store_timeout_ms(),
            concurrency: default_concurrency(),
            worker_id: None,
        }
    }
}
