use uuid::Uuid;

/// The scheduler's job store could not complete an operation.
///
/// This is the only failure an enqueue caller ever sees. The worker loop
/// retries it with a fixed delay and never lets it take the process down.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("job store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt job record {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },
}
