use thiserror::Error;

/// Storage failure. Never surfaced to the recognition decision path; the
/// store logs and swallows these on the append and maintenance paths.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection error: {0}")]
    Connection(#[from] tokio_rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("log writer task has stopped")]
    WriterClosed,
}
