//! Error types.
//!
//! `StratumError` describes why a single request (or a whole connection) to a
//! Stratum server failed. These never reach the embedding application: the
//! engine reacts to them by closing, re-scoring and replacing connections.
//!
//! `SyncError` is what caller-facing operations return.

/// Failure of one Stratum request or connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StratumError {
    /// Dial failure, socket error or unreadable frame.
    #[error("{uri}: transport error: {message}")]
    Transport { uri: String, message: String },

    /// The server sent something that is not valid Stratum JSON-RPC.
    #[error("{uri}: protocol error: {message}")]
    Protocol { uri: String, message: String },

    /// No reply arrived within the configured timeout.
    #[error("{uri}: request timed out")]
    Timeout { uri: String },

    /// The server's error text looks like a defacement / phishing message.
    #[error("{uri}: A connection error occurred. Try sending again")]
    SpamServer { uri: String },

    /// The server answered with a JSON-RPC `error` object.
    #[error("{uri}: server error {code:?}: {message}")]
    Rpc {
        uri: String,
        code: Option<i64>,
        message: String,
    },

    /// The connection went away before a reply arrived.
    #[error("{uri}: connection closed")]
    Closed { uri: String },
}

impl StratumError {
    pub fn uri(&self) -> &str {
        match self {
            StratumError::Transport { uri, .. }
            | StratumError::Protocol { uri, .. }
            | StratumError::Timeout { uri }
            | StratumError::SpamServer { uri }
            | StratumError::Rpc { uri, .. }
            | StratumError::Closed { uri } => uri,
        }
    }

    pub fn protocol(uri: &str, message: impl Into<String>) -> Self {
        StratumError::Protocol {
            uri: uri.to_string(),
            message: message.into(),
        }
    }

    pub fn transport(uri: &str, message: impl Into<String>) -> Self {
        StratumError::Transport {
            uri: uri.to_string(),
            message: message.into(),
        }
    }

    /// Errors after which the connection itself is still usable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StratumError::Timeout { .. } | StratumError::Closed { .. }
        )
    }
}

/// Errors returned to the embedding application.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Every connection rejected the broadcast. Carries the last rejection.
    #[error("broadcast failed on every server: {0}")]
    BroadcastFailed(StratumError),

    /// There was no open connection to broadcast on.
    #[error("no server connections available")]
    NoConnections,

    #[error("insufficient funds: needed {needed}, available {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("unknown address {0}")]
    UnknownAddress(String),

    /// The info server could not be reached or sent something unusable.
    #[error("fetching server list: {0}")]
    ServerList(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
