//! Error taxonomy for the serving and tunnel subsystems

use crate::state::ServerState;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from starting or stopping the serving endpoint
#[derive(Debug, Error)]
pub enum ServeError {
    /// Port outside `1..=65535`
    #[error("Invalid port: {0} (expected 1-65535)")]
    InvalidPort(u32),
    /// Listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    /// Health probe never succeeded
    #[error("Server at {addr} did not answer after {attempts} health probes")]
    StartupTimeout { addr: SocketAddr, attempts: u32 },
}

/// Errors from starting the tunnel
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Tunneling tool '{0}' is not installed")]
    ToolNotInstalled(String),
    /// Tool rejected the auth token or could not be run for it
    #[error("Tunnel auth token was rejected: {0}")]
    AuthConfig(String),
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// Tunnel requires a running server
    #[error("Tunnel requires a running server (server is {0})")]
    PreconditionFailed(ServerState),
    #[error("Tunnel auth token is empty")]
    MissingToken,
}

/// Any error surfaced by the coordinator
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Serve(#[from] ServeError),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

/// Result type alias for file server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Helper trait to convert errors into user-friendly messages
pub trait UserMessage {
    fn user_message(&self) -> String;
}

impl UserMessage for ServeError {
    fn user_message(&self) -> String {
        match self {
            ServeError::InvalidPort(port) => {
                format!("❌ Port {} is not valid, pick one between 1 and 65535", port)
            }
            ServeError::Bind { addr, .. } => {
                format!("❌ Cannot listen on {}, is the port already in use?", addr)
            }
            ServeError::StartupTimeout { .. } => "❌ Server did not start in time".to_string(),
        }
    }
}

impl UserMessage for TunnelError {
    fn user_message(&self) -> String {
        match self {
            TunnelError::ToolNotInstalled(program) => {
                format!("❌ '{}' was not found, install it first", program)
            }
            TunnelError::AuthConfig(reason) => format!("❌ Tunnel configuration failed: {}", reason),
            TunnelError::Spawn { program, .. } => format!("❌ Could not launch '{}'", program),
            TunnelError::PreconditionFailed(_) => "⚠️ Start the server before the tunnel".to_string(),
            TunnelError::MissingToken => "❌ Enter the tunnel auth token".to_string(),
        }
    }
}

impl UserMessage for Error {
    fn user_message(&self) -> String {
        match self {
            Error::Serve(e) => e.user_message(),
            Error::Tunnel(e) => e.user_message(),
        }
    }
}
