use db::DbError;
use storage::StorageError;

/// Infrastructure failures while executing a job. None of these fail the
/// job itself: the worker releases the delivery and it is tried again.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The runner was shut down while a stage was executing.
    #[error("interrupted during stage {0}")]
    Interrupted(String),

    #[error("configuration error: {0}")]
    Config(String),
}
