//! Lifecycle states for the serving endpoint and the tunnel

use std::fmt;

/// Lifecycle of the HTTP serving endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerState {
    #[default]
    Stopped,
    /// Listener bound, waiting for the health probe
    Starting,
    Running,
    /// Bind error or probe timeout; must be acknowledged before restarting
    Failed,
}

impl ServerState {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: ServerState) -> bool {
        use ServerState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopped)
                | (Failed, Stopped)
        )
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Lifecycle of the supervised tunnel process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelState {
    #[default]
    Stopped,
    /// Process spawned, no public address seen yet
    Starting,
    /// A forwarding announcement was parsed
    Running,
    /// Process exited without being asked to
    Failed,
}

impl TunnelState {
    /// Starting or Running
    pub fn is_active(self) -> bool {
        matches!(self, TunnelState::Starting | TunnelState::Running)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: TunnelState) -> bool {
        use TunnelState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Failed)
                | (Starting, Stopped)
                | (Running, Stopped)
                | (Failed, Stopped)
        )
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Stopped => "stopped",
            TunnelState::Starting => "starting",
            TunnelState::Running => "running",
            TunnelState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Protocols accepted by the tunneling tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelProtocol {
    #[default]
    Http,
    Https,
    Tcp,
    Tls,
}

impl TunnelProtocol {
    /// Argument passed to the tunneling tool
    pub fn as_arg(self) -> &'static str {
        match self {
            TunnelProtocol::Http => "http",
            TunnelProtocol::Https => "https",
            TunnelProtocol::Tcp => "tcp",
            TunnelProtocol::Tls => "tls",
        }
    }
}

impl fmt::Display for TunnelProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

/// Parse tunnel protocol from string
impl std::str::FromStr for TunnelProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "http" | "" => Ok(TunnelProtocol::Http),
            "https" => Ok(TunnelProtocol::Https),
            "tcp" => Ok(TunnelProtocol::Tcp),
            "tls" => Ok(TunnelProtocol::Tls),
            _ => Err(format!("Unknown tunnel protocol: {}", s)),
        }
    }
}
