//! Lifecycle coordination of the serving endpoint and the tunnel
//!
//! [`LifecycleCoordinator`] is the only entry point the presentation layer
//! talks to. Every transition goes through one async mutex, so the endpoint
//! and the tunnel never change state concurrently, and the tunnel is always
//! torn down before the endpoint it forwards to.

use crate::config::Config;
use crate::error::{Result, ServeError, TunnelError, UserMessage};
use crate::notify::{self, NotificationQueue, Notifier};
use crate::registry::{FileDescriptor, FileRegistry, Snapshot};
use crate::server::{EndpointOptions, ServingEndpoint};
use crate::state::{ServerState, TunnelProtocol, TunnelState};
use crate::tool::TunnelTool;
use crate::tunnel::{TunnelStatus, TunnelSupervisor, DEFAULT_STOP_TIMEOUT};
use crate::utils::{collect_files, local_ip};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// Settings for [`LifecycleCoordinator::new`]
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub endpoint: EndpointOptions,
    pub tool: TunnelTool,
    pub tunnel_stop_timeout: Duration,
    pub notify_capacity: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            endpoint: EndpointOptions::default(),
            tool: TunnelTool::default(),
            tunnel_stop_timeout: DEFAULT_STOP_TIMEOUT,
            notify_capacity: notify::DEFAULT_CAPACITY,
        }
    }
}

impl From<&Config> for CoordinatorOptions {
    fn from(config: &Config) -> Self {
        Self {
            endpoint: EndpointOptions {
                host: config.host.clone(),
                local_ip: local_ip(),
                shutdown_grace: config.shutdown_grace,
                secret: config.secret.clone(),
                ..EndpointOptions::default()
            },
            tool: TunnelTool::new(config.tunnel_bin.clone()),
            tunnel_stop_timeout: config.tunnel_stop_timeout,
            notify_capacity: config.notify_capacity,
        }
    }
}

struct Subsystems {
    server: ServingEndpoint,
    tunnel: TunnelSupervisor,
}

struct Inner {
    registry: FileRegistry,
    notifier: Notifier,
    tool_version: Option<String>,
    subsystems: Mutex<Subsystems>,
    server_state: watch::Receiver<ServerState>,
    tunnel_status: watch::Receiver<TunnelStatus>,
    bound: RwLock<Option<SocketAddr>>,
}

/// Orchestrates serving and tunneling
///
/// Cheap to clone; all clones drive the same subsystems.
#[derive(Clone)]
pub struct LifecycleCoordinator {
    inner: Arc<Inner>,
}

impl LifecycleCoordinator {
    /// Build the coordinator and the queue its notifications arrive on
    ///
    /// Runs the tunneling tool's installation check once.
    pub async fn new(options: CoordinatorOptions) -> (Self, NotificationQueue) {
        let (notifier, queue) = notify::channel(options.notify_capacity);
        let registry = FileRegistry::new();

        let tool_version = options.tool.detect().await;
        match &tool_version {
            Some(version) => tracing::info!("Tunnel tool '{}' found: {}", options.tool.program(), version),
            None => tracing::warn!("Tunnel tool '{}' is not installed", options.tool.program()),
        }

        let server = ServingEndpoint::new(registry.clone(), notifier.clone(), options.endpoint);
        let tunnel = TunnelSupervisor::new(options.tool, notifier.clone(), options.tunnel_stop_timeout);
        let server_state = server.subscribe();
        let tunnel_status = tunnel.subscribe();

        let coordinator = Self {
            inner: Arc::new(Inner {
                registry,
                notifier,
                tool_version,
                subsystems: Mutex::new(Subsystems { server, tunnel }),
                server_state,
                tunnel_status,
                bound: RwLock::new(None),
            }),
        };
        (coordinator, queue)
    }

    /// Start serving `files` on `port`
    ///
    /// The registry is replaced with `files` only once the endpoint is
    /// Running.
    pub async fn start_serving(&self, port: u32, files: Vec<FileDescriptor>) -> Result<()> {
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or(ServeError::InvalidPort(port))?;

        let mut subsystems = self.inner.subsystems.lock().await;
        subsystems.server.start(port).await?;
        self.set_bound(subsystems.server.local_addr());
        drop(subsystems);

        self.replace_files(files).await;
        Ok(())
    }

    /// Stop serving, tearing the tunnel down first
    ///
    /// Also clears a Failed endpoint. A second call does nothing.
    pub async fn stop_serving(&self) {
        let mut subsystems = self.inner.subsystems.lock().await;
        if subsystems.tunnel.state() != TunnelState::Stopped {
            subsystems.tunnel.stop().await;
        }
        subsystems.server.stop().await;
        subsystems.server.acknowledge_failure().await;
        self.set_bound(None);
    }

    /// Expose the running endpoint through the tunneling tool
    ///
    /// # Arguments
    /// * `protocol` - Protocol to expose
    /// * `local_address` - `host:port` to forward, defaults to the endpoint's loopback address
    /// * `token` - Auth token for the tool
    pub async fn start_tunnel(
        &self,
        protocol: TunnelProtocol,
        local_address: Option<&str>,
        token: &str,
    ) -> Result<()> {
        let mut subsystems = self.inner.subsystems.lock().await;

        let server_state = subsystems.server.state();
        if server_state != ServerState::Running {
            return Err(TunnelError::PreconditionFailed(server_state).into());
        }
        let token = token.trim();
        if token.is_empty() {
            return Err(TunnelError::MissingToken.into());
        }
        if !self.tool_installed() {
            return Err(TunnelError::ToolNotInstalled(
                subsystems.tunnel.tool().program().to_string(),
            )
            .into());
        }

        let local_address = match local_address.map(str::trim).filter(|a| !a.is_empty()) {
            Some(address) => address.to_string(),
            None => {
                let port = subsystems.server.local_addr().map(|a| a.port()).unwrap_or_default();
                format!("127.0.0.1:{}", port)
            }
        };

        if let Err(e) = subsystems.tunnel.start(protocol, &local_address, token).await {
            tracing::error!("Tunnel start failed: {}", e);
            self.inner
                .notifier
                .tunnel_state(TunnelState::Stopped, Some(e.user_message()))
                .await;
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn stop_tunnel(&self) {
        self.inner.subsystems.lock().await.tunnel.stop().await;
    }

    /// Add one file; returns whether the list changed
    pub async fn add_file(&self, descriptor: FileDescriptor) -> bool {
        let changed = self.inner.registry.add(descriptor);
        if changed {
            self.publish_files().await;
        }
        changed
    }

    /// Add a file, or every regular file below a folder
    ///
    /// # Returns
    /// Number of files that were not listed yet
    pub async fn add_path(&self, path: &Path) -> usize {
        let added = collect_files(path)
            .into_iter()
            .filter(|descriptor| self.inner.registry.add(descriptor.clone()))
            .count();
        if added > 0 {
            self.publish_files().await;
        }
        added
    }

    /// Remove the entry with `path`; returns whether the list changed
    pub async fn remove_file(&self, path: &str) -> bool {
        let changed = self.inner.registry.remove(path);
        if changed {
            self.publish_files().await;
        }
        changed
    }

    pub async fn replace_files(&self, files: Vec<FileDescriptor>) {
        self.inner.registry.replace_all(files);
        self.publish_files().await;
    }

    pub fn files(&self) -> Snapshot {
        self.inner.registry.snapshot()
    }

    pub fn server_state(&self) -> ServerState {
        *self.inner.server_state.borrow()
    }

    pub fn tunnel_state(&self) -> TunnelState {
        self.inner.tunnel_status.borrow().state
    }

    pub fn public_address(&self) -> Option<String> {
        self.inner.tunnel_status.borrow().public_address.clone()
    }

    /// Address the endpoint is bound to while it is up
    pub fn local_address(&self) -> Option<SocketAddr> {
        *self.inner.bound.read().unwrap_or_else(|e| e.into_inner())
    }

    /// URL of the endpoint on the LAN while it is up
    pub async fn lan_url(&self) -> Option<String> {
        self.inner.subsystems.lock().await.server.lan_url()
    }

    pub fn tool_installed(&self) -> bool {
        self.inner.tool_version.is_some()
    }

    pub fn tool_version(&self) -> Option<&str> {
        self.inner.tool_version.as_deref()
    }

    pub async fn acknowledge_server_failure(&self) {
        self.inner
            .subsystems
            .lock()
            .await
            .server
            .acknowledge_failure()
            .await;
    }

    /// Stop everything before the process exits
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down");
        self.stop_serving().await;
    }

    async fn publish_files(&self) {
        self.inner.notifier.file_list(self.inner.registry.snapshot()).await;
    }

    fn set_bound(&self, addr: Option<SocketAddr>) {
        *self.inner.bound.write().unwrap_or_else(|e| e.into_inner()) = addr;
    }
}
