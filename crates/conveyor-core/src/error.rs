use std::result;

pub type Result<T> = result::Result<T, Error>;

/// Error taxonomy for the Conveyor core.
///
/// - `InvalidArgument` and `Config` are programming/startup errors and are
///   never retried.
/// - `Database` is transient from the caller's perspective: dispatcher loops
///   log and continue, and claimed-but-unfinished rows are reclaimed by the
///   reaper once their lease expires.
/// - `LeaseLost` fires when a lease runner fails renewal; dependent loops
///   terminate through the runner's watch channel.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("lease lost for resource {resource}")]
    LeaseLost { resource: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
