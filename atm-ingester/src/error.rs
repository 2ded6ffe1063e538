use thiserror::Error;

/// Errors raised while turning raw file bytes into ATM records.
#[derive(Error, Debug)]
pub enum NormalizeError {
    /// The file is not valid JSON (or not valid UTF-8). The whole file is
    /// skipped; nothing is persisted.
    #[error("failed to decode file payload as JSON: {0}")]
    Parse(#[from] serde_json::Error),
    /// A required timestamp is missing or malformed. Fatal for the file.
    #[error("invalid record field {field}: {detail}")]
    Validation { field: &'static str, detail: String },
}

/// Errors from the bulk persistence collaborator.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: &'static str,
        error: sqlx::Error,
    },
}

/// Errors from the message source collaborator.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The blocking pull outlived its server-side deadline. Non-fatal,
    /// the loop retries on the next cycle.
    #[error("pull request timed out")]
    Timeout,
    #[error("message source transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed message source response: {0}")]
    Decode(String),
}

/// Errors from the object store collaborator. Absence of an object is not
/// an error, see `storage::FetchOutcome`.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object store transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("object store returned status {0}")]
    UnexpectedStatus(reqwest::StatusCode),
}

/// Umbrella for a single message's pipeline, used to route logging and
/// acknowledgment decisions in the ingestion loop.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
