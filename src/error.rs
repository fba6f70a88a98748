use thiserror::Error;

/// Fatal errors returned directly from host-facing calls (`enable`, `request_sync_once`,
/// `start_first_load`, ...). These never appear on `SyncState::api_error`; a caller receiving
/// one knows sync did not run at all.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("programmer error: {0}")]
    Programmer(&'static str),

    #[error("invalid state: {0}")]
    State(String),

    #[error("unknown table: {0}")]
    UnknownTable(String),
}

/// A non-fatal, per-cycle failure. Recorded on `SyncState::api_error`; never propagated as
/// `Result::Err`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    pub table: Option<String>,
    pub message: String,
    pub is_network_error: bool,
}

impl ApiError {
    pub fn network(table: impl Into<Option<String>>, message: impl Into<String>) -> Self {
        Self { table: table.into(), message: message.into(), is_network_error: true }
    }

    pub fn server(table: impl Into<Option<String>>, message: impl Into<String>) -> Self {
        Self { table: table.into(), message: message.into(), is_network_error: false }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.table {
            Some(t) => write!(f, "[{t}] {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}
