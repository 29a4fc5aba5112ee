use std::{future::Future, time::Duration};

use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    #[snafu(display("Internal error"))]
    InternalServerError {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    MigrationError {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Invalid recipient address {address:?}"))]
    InvalidRecipient { address: String },

    #[snafu(display("Transport failed: {message}"))]
    Transport { message: String },

    #[snafu(display("{operation} timed out after {duration:?}"))]
    Timeout {
        operation: &'static str,
        duration: Duration,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::InternalServerError { source: Some(e) }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::MigrationError { source }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::InternalServerError {
            source: Some(e.into()),
        }
    }

    pub fn message_not_found(id: i64) -> Self {
        Self::NotFound {
            resource: format!("message {id}"),
        }
    }

    pub fn invalid_recipient(address: impl Into<String>) -> Self {
        Self::InvalidRecipient {
            address: address.into(),
        }
    }

    /// Wraps any transport-side failure. All transport failures are treated
    /// the same way by the delivery worker.
    pub fn transport(message: impl std::fmt::Display) -> Self {
        Self::Transport {
            message: message.to_string(),
        }
    }

    pub fn timeout(operation: &'static str, duration: Duration) -> Self {
        Self::Timeout {
            operation,
            duration,
        }
    }

    /// Whether the error came from the backing store rather than the transport
    /// or the caller's input.
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Sqlx { .. } | Self::MigrationError { .. })
    }
}

/// Bounds `fut` by `duration`, turning an elapsed deadline into
/// [`Error::Timeout`].
pub(crate) async fn with_timeout<F, O>(
    operation: &'static str,
    duration: Duration,
    fut: F,
) -> Result<O, Error>
where
    F: Future<Output = Result<O, Error>>,
{
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| Error::timeout(operation, duration))?
}
