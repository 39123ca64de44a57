//! Error types for the card client engine.
//!
//! None of these cross the public API for connection or protocol trouble;
//! the session manager logs them and reconnects.

use std::io;
use std::path::PathBuf;

use cardclient_protocol::ProtocolError;
use thiserror::Error;

/// Errors inside a client's session.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The client was created outside of a tokio runtime.
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    /// Connecting, reading or writing failed.
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    /// The protocol plug-in rejected the traffic.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The server did not finish the login in time.
    #[error("Login timed out")]
    LoginTimeout,

    /// The server closed the connection.
    #[error("Connection closed by server")]
    ConnectionClosed,

    /// Shutdown or reconfiguration was requested.
    #[error("Interrupted")]
    Interrupted,
}

/// Errors while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}
