use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Watcher error: {0}")]
    Watch(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Transient failures get a single retry before the caller degrades
    /// (treat as significant, treat as cache miss).
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Io(err) => !matches!(
                err.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::InvalidData
            ),
            PipelineError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::Database(_)
            ),
            PipelineError::Cache(_) => true,
            _ => false,
        }
    }

    /// Configuration and cancellation errors are never retried by the
    /// supervisor; everything else escalates to a restart.
    pub fn is_fatal_to_generation(&self) -> bool {
        !matches!(
            self,
            PipelineError::Config(_) | PipelineError::Cancelled(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Run `op` and, if it fails with a transient error, run it exactly once more.
pub async fn retry_once<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(err) if err.is_transient() => {
            tracing::debug!(error = %err, "transient failure, retrying once");
            op().await
        }
        Err(err) => Err(err),
    }
}
