//! Error taxonomy for the scheduler core, layered the way the rest of the
//! stack expects: a single [`RepoError`] absorbs every `sqlx` failure once,
//! and component-level errors wrap it with `#[from]` so call sites keep
//! using `?`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Internal(#[from] sqlx::Error),
    #[error("row not found")]
    NotFound,
}

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error(transparent)]
    Repo(#[from] RepoError),
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error("no healthy proxy available for profile {0}")]
    Exhausted(uuid::Uuid),
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to open browser session: {0}")]
    OpenFailed(String),
    #[error("send action failed: {0}")]
    SendFailed(String),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("no proxy assigned for profile, worker cannot start")]
    NoProxy,
}
