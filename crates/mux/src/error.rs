use std::time::Duration;

use serde_json::Value;

use crate::ServerNameError;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy surfaced through the manager facade.
///
/// "Already connected" is deliberately not here: `connect_server` reports it
/// as a [`crate::ConnectOutcome`] sentinel, not a failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("server not connected: {0}")]
    NotConnected(String),

    #[error("server not initialized: {0}")]
    NotInitialized(String),

    #[error("failed to spawn server {name} ({command}): {source}")]
    Spawn {
        name: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error (server={name}): {message}")]
    Transport { name: String, message: String },

    #[error("server {name} returned error {code} for {operation}: {message}")]
    Protocol {
        name: String,
        operation: String,
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("request timed out after {timeout:?} (server={name}, operation={operation})")]
    Timeout {
        name: String,
        operation: String,
        timeout: Duration,
    },

    #[error(transparent)]
    InvalidName(#[from] ServerNameError),
}

impl Error {
    /// Maps a transport-level failure onto the facade taxonomy, tagging it
    /// with the server and the operation that was in flight.
    pub(crate) fn from_rpc(name: &str, operation: &str, err: mux_jsonrpc::Error) -> Self {
        match err {
            mux_jsonrpc::Error::Rpc {
                code,
                message,
                data,
            } => Error::Protocol {
                name: name.to_string(),
                operation: operation.to_string(),
                code,
                message,
                data,
            },
            mux_jsonrpc::Error::Protocol(protocol)
                if protocol.kind == mux_jsonrpc::ProtocolErrorKind::Timeout =>
            {
                Error::Timeout {
                    name: name.to_string(),
                    operation: operation.to_string(),
                    timeout: crate::REQUEST_TIMEOUT,
                }
            }
            other => Error::Transport {
                name: name.to_string(),
                message: other.to_string(),
            },
        }
    }
}
