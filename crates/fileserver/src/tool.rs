//! Contract with the external tunneling CLI
//!
//! The tool must support:
//! - `--version` as an installation check
//! - `authtoken <token>`, exiting non-zero when the token is rejected
//! - `<protocol> <local-address>`, long-running, printing a `Forwarding` line
//! - `kill`, asking the running instance to shut itself down

use crate::error::TunnelError;
use crate::state::TunnelProtocol;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};

/// Default tunneling executable
pub const DEFAULT_TOOL: &str = "cpolar";

/// Invocation of the tunneling executable
#[derive(Debug, Clone)]
pub struct TunnelTool {
    program: String,
    /// Inserted before every subcommand, e.g. a script path when `program` is a shell
    leading_args: Vec<String>,
}

impl Default for TunnelTool {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL)
    }
}

impl TunnelTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.leading_args).stdin(Stdio::null());
        command
    }

    /// Run the installation check
    ///
    /// # Returns
    /// * `Some(version)` - first line the tool printed, if it exited successfully
    /// * `None` - tool missing or unhealthy
    pub async fn detect(&self) -> Option<String> {
        let output = match self.command().arg("--version").output().await {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!("{} --version failed: {}", self.program, e);
                return None;
            }
        };

        if !output.status.success() {
            tracing::debug!("{} --version exited with {}", self.program, output.status);
            return None;
        }

        let version = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        Some(version)
    }

    /// Store the auth token with the tool
    pub async fn apply_auth_token(&self, token: &str) -> Result<(), TunnelError> {
        let output = self
            .command()
            .args(["authtoken", token])
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    TunnelError::AuthConfig(format!("'{}' is not installed", self.program))
                } else {
                    TunnelError::AuthConfig(format!("failed to run '{}': {}", self.program, e))
                }
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let reason = [stderr.trim(), stdout.trim()]
            .into_iter()
            .find(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("authtoken exited with {}", output.status));
        Err(TunnelError::AuthConfig(reason))
    }

    /// Launch the long-running tunnel with piped output
    pub fn spawn(&self, protocol: TunnelProtocol, local_address: &str) -> Result<Child, TunnelError> {
        self.command()
            .args([protocol.as_arg(), local_address])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TunnelError::Spawn {
                program: self.program.clone(),
                source,
            })
    }

    /// Ask the running instance to terminate through the tool itself
    pub async fn request_kill(&self) -> std::io::Result<ExitStatus> {
        self.command()
            .arg("kill")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
    }
}
