//! Error kinds shared by the mail, store and import layers.

use std::path::PathBuf;

/// Top-level error for MIST.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Mail source error: {0}")]
    Source(#[from] SourceError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Credential store error: {0}")]
    Credential(#[from] CredentialError),
}

/// Errors raised by the target store gateway.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Not connected to the target store")]
    NotConnected,

    #[error("Unable to open target store {path}: {reason}")]
    Connection { path: PathBuf, reason: String },

    #[error("Query matched {rows} rows where at most one was expected: {sql}")]
    AmbiguousResult { sql: String, rows: usize },

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Write failed: {0}")]
    Write(String),
}

/// Errors raised by a mail source while connecting or enumerating.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Source {source_id} connection failed: {reason}")]
    Connection { source_id: i64, reason: String },

    #[error("Source {source_id} token exchange failed: {reason}")]
    Token { source_id: i64, reason: String },

    #[error("Source {source_id} folder '{folder}' unavailable: {reason}")]
    Folder {
        source_id: i64,
        folder: String,
        reason: String,
    },

    #[error("Source {source_id} message {position} could not be read: {reason}")]
    Fetch {
        source_id: i64,
        position: u32,
        reason: String,
    },

    #[error("Source {source_id} is not ready: {reason}")]
    NotReady { source_id: i64, reason: String },
}

impl SourceError {
    /// True for transport and auth failures, token failures included.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Token { .. })
    }

    pub fn source_id(&self) -> i64 {
        match self {
            Self::Connection { source_id, .. }
            | Self::Token { source_id, .. }
            | Self::Folder { source_id, .. }
            | Self::Fetch { source_id, .. }
            | Self::NotReady { source_id, .. } => *source_id,
        }
    }
}

/// Errors raised by the on-disk refresh token store.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed token file '{path}': {reason}")]
    Serialization { path: PathBuf, reason: String },
}

impl CredentialError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Query(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_errors_count_as_connection_errors() {
        let token = SourceError::Token {
            source_id: 3,
            reason: "invalid_grant".into(),
        };
        let folder = SourceError::Folder {
            source_id: 3,
            folder: "INBOX".into(),
            reason: "no such mailbox".into(),
        };
        assert!(token.is_connection_error());
        assert!(!folder.is_connection_error());
        assert_eq!(folder.source_id(), 3);
    }

    #[test]
    fn store_errors_convert_into_top_level() {
        let err: Error = StoreError::NotConnected.into();
        assert_eq!(
            err.to_string(),
            "Store error: Not connected to the target store"
        );
    }
}
