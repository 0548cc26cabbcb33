//! Supervision of the external tunneling process
//!
//! One [`TunnelSupervisor`] manages at most one tunnel process. Starting it
//! configures the auth token and spawns the tool; a dedicated task then reads
//! the merged stdout/stderr line by line, forwards every line to the
//! notification queue and promotes the tunnel to Running on the first
//! forwarding announcement. The same task owns the exit path, so state
//! changes after start only ever come from one place.

use crate::error::TunnelError;
use crate::forwarding::{decode_line, parse_forwarding};
use crate::notify::Notifier;
use crate::state::{TunnelProtocol, TunnelState};
use crate::tool::TunnelTool;
use futures::StreamExt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};

/// Default time to wait for a graceful exit before killing the process
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for a hard-killed process to be reaped
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// How long buffered output is still read after the process exited
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// How long `stop` waits for the reader once it was told to kill
const FORCED_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

const FORCED_MESSAGE: &str = "Tunnel process did not exit in time and was forcibly terminated";

/// Current tunnel status
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelStatus {
    pub state: TunnelState,
    /// Only set while Running
    pub public_address: Option<String>,
}

/// Status cell plus the notification sink, shared with the reader task
struct Shared {
    status: watch::Sender<TunnelStatus>,
    notifier: Notifier,
}

impl Shared {
    fn state(&self) -> TunnelState {
        self.status.borrow().state
    }

    async fn transition(&self, next: TunnelState, detail: Option<String>) {
        let mut previous = next;
        let mut cleared = false;
        let changed = self.status.send_if_modified(|status| {
            if status.state == next {
                return false;
            }
            previous = status.state;
            status.state = next;
            if next != TunnelState::Running {
                cleared = status.public_address.take().is_some();
            }
            true
        });
        if !changed {
            return;
        }

        if !previous.can_transition_to(next) {
            tracing::warn!("Unexpected tunnel transition {} -> {}", previous, next);
        }
        tracing::info!("Tunnel {} -> {}", previous, next);
        self.notifier.tunnel_state(next, detail).await;
        if cleared {
            self.notifier.public_address(None).await;
        }
    }

    /// Record a forwarding announcement
    async fn announce(&self, url: String) {
        let mut promoted = false;
        let changed = self.status.send_if_modified(|status| {
            if !status.state.is_active() {
                return false;
            }
            promoted = status.state == TunnelState::Starting;
            if promoted {
                status.state = TunnelState::Running;
            }
            if status.public_address.as_deref() == Some(url.as_str()) && !promoted {
                return false;
            }
            status.public_address = Some(url.clone());
            true
        });
        if !changed {
            return;
        }

        tracing::info!("Tunnel public address: {}", url);
        if promoted {
            self.notifier
                .tunnel_state(TunnelState::Running, Some(url.clone()))
                .await;
        }
        self.notifier.public_address(Some(url)).await;
    }
}

/// A spawned tunnel process and its reader task
struct Session {
    stop_requested: Arc<AtomicBool>,
    force_kill: Option<oneshot::Sender<()>>,
    reader: JoinHandle<()>,
    joined: bool,
}

impl Session {
    /// Wait for the reader task to finish
    ///
    /// # Returns
    /// * `false` if `limit` elapsed first
    async fn join(&mut self, limit: Option<Duration>) -> bool {
        if self.joined {
            return true;
        }

        let result = match limit {
            Some(limit) => match tokio::time::timeout(limit, &mut self.reader).await {
                Ok(result) => result,
                Err(_) => return false,
            },
            None => (&mut self.reader).await,
        };
        self.joined = true;

        if let Err(e) = result {
            if !e.is_cancelled() {
                tracing::error!("Tunnel reader task failed: {}", e);
            }
        }
        true
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Dropping the task drops the child, which is spawned with kill_on_drop
        self.reader.abort();
    }
}

/// Spawns, monitors and terminates the tunneling process
pub struct TunnelSupervisor {
    tool: TunnelTool,
    shared: Arc<Shared>,
    stop_timeout: Duration,
    session: Option<Session>,
}

impl TunnelSupervisor {
    /// Create a supervisor
    ///
    /// # Arguments
    /// * `tool` - Tunneling executable to drive
    /// * `notifier` - Sink for log lines and state changes
    /// * `stop_timeout` - Grace period for `stop` before the process is killed
    pub fn new(tool: TunnelTool, notifier: Notifier, stop_timeout: Duration) -> Self {
        let (status, _) = watch::channel(TunnelStatus::default());
        Self {
            tool,
            shared: Arc::new(Shared { status, notifier }),
            stop_timeout,
            session: None,
        }
    }

    pub fn tool(&self) -> &TunnelTool {
        &self.tool
    }

    pub fn status(&self) -> TunnelStatus {
        self.shared.status.borrow().clone()
    }

    pub fn state(&self) -> TunnelState {
        self.shared.state()
    }

    pub fn public_address(&self) -> Option<String> {
        self.shared.status.borrow().public_address.clone()
    }

    /// Observe status changes without going through the supervisor
    pub fn subscribe(&self) -> watch::Receiver<TunnelStatus> {
        self.shared.status.subscribe()
    }

    /// Start the tunnel
    ///
    /// The caller guarantees the local server is running. Auth and spawn
    /// failures are returned here; anything after that is reported through
    /// the state and the log lines only.
    ///
    /// # Arguments
    /// * `protocol` - Protocol to expose
    /// * `local_address` - Local `host:port` to forward to
    /// * `auth_token` - Token passed to `authtoken`
    pub async fn start(
        &mut self,
        protocol: TunnelProtocol,
        local_address: &str,
        auth_token: &str,
    ) -> Result<(), TunnelError> {
        if self.state().is_active() {
            tracing::warn!("Tunnel already {}, ignoring start", self.state());
            return Ok(());
        }
        if self.state() == TunnelState::Failed {
            self.finish_session().await;
            self.shared
                .transition(TunnelState::Stopped, Some("Previous tunnel cleared".to_string()))
                .await;
        }

        tracing::info!(
            "Starting {} tunnel to {} via {}",
            protocol,
            local_address,
            self.tool.program()
        );

        self.tool.apply_auth_token(auth_token).await?;
        let mut child = self.tool.spawn(protocol, local_address)?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            if let Err(e) = child.start_kill() {
                tracing::warn!("Failed to kill uncaptured tunnel process: {}", e);
            }
            return Err(TunnelError::Spawn {
                program: self.tool.program().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "output was not captured"),
            });
        };

        self.shared
            .transition(
                TunnelState::Starting,
                Some(format!("{} {}", protocol, local_address)),
            )
            .await;
        self.shared
            .notifier
            .log_line(format!("Starting {} {} {}", self.tool.program(), protocol, local_address))
            .await;

        let stop_requested = Arc::new(AtomicBool::new(false));
        let (force_kill_tx, force_kill_rx) = oneshot::channel();
        let reader = tokio::spawn(supervise(
            child,
            stdout,
            stderr,
            self.shared.clone(),
            stop_requested.clone(),
            force_kill_rx,
        ));

        self.session = Some(Session {
            stop_requested,
            force_kill: Some(force_kill_tx),
            reader,
            joined: false,
        });
        Ok(())
    }

    /// Stop the tunnel
    ///
    /// Asks the tool to terminate its running instance and waits until the
    /// reader task has observed the exit. If that takes longer than the stop
    /// timeout, the process is killed and the tunnel forced to Stopped.
    /// Idempotent.
    pub async fn stop(&mut self) {
        let Some(session) = self.session.as_mut() else {
            if self.state() == TunnelState::Failed {
                self.shared.transition(TunnelState::Stopped, None).await;
            }
            return;
        };

        session.stop_requested.store(true, Ordering::SeqCst);

        if !session.reader.is_finished() {
            tracing::info!("Requesting tunnel shutdown via '{} kill'", self.tool.program());
            match self.tool.request_kill().await {
                Ok(status) if !status.success() => {
                    tracing::warn!("'{} kill' exited with {}", self.tool.program(), status)
                }
                Err(e) => tracing::warn!("Failed to run '{} kill': {}", self.tool.program(), e),
                Ok(_) => {}
            }

            if !session.join(Some(self.stop_timeout)).await {
                tracing::warn!(
                    "Tunnel did not exit within {:?}, terminating it",
                    self.stop_timeout
                );
                if let Some(force_kill) = session.force_kill.take() {
                    let _ = force_kill.send(());
                }

                if !session.join(Some(FORCED_JOIN_TIMEOUT)).await {
                    tracing::error!(
                        "Tunnel reader still running {:?} after the kill, abandoning it",
                        FORCED_JOIN_TIMEOUT
                    );
                    session.reader.abort();
                    self.shared
                        .transition(TunnelState::Stopped, Some(FORCED_MESSAGE.to_string()))
                        .await;
                    self.shared.notifier.log_line(FORCED_MESSAGE).await;
                }
            }
        }

        self.finish_session().await;

        // The process may have died on its own before the stop request landed
        if self.state() != TunnelState::Stopped {
            self.shared
                .transition(TunnelState::Stopped, Some("Tunnel stopped".to_string()))
                .await;
        }
    }

    /// Wait for the reader task to end and drop the session
    async fn finish_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.join(None).await;
        }
    }
}

/// Body of the reader task: pump output, then handle the exit
///
/// The exit path is driven by the process itself, not by the pipes: a
/// descendant may keep them open long after the tool is gone.
async fn supervise(
    mut child: Child,
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    shared: Arc<Shared>,
    stop_requested: Arc<AtomicBool>,
    mut force_kill: oneshot::Receiver<()>,
) {
    let codec = || AnyDelimiterCodec::new(b"\n".to_vec(), Vec::new());
    let mut lines = futures::stream::select(
        FramedRead::new(stdout, codec()),
        FramedRead::new(stderr, codec()),
    );
    let mut output_closed = false;

    let exit = loop {
        tokio::select! {
            frame = lines.next(), if !output_closed => match frame {
                Some(frame) => forward(&shared, frame).await,
                None => output_closed = true,
            },
            status = child.wait() => break Exit::Exited(status.ok()),
            _ = &mut force_kill => break Exit::Forced,
        }
    };

    let (next, message) = match exit {
        Exit::Forced => {
            kill(&mut child).await;
            (TunnelState::Stopped, FORCED_MESSAGE.to_string())
        }
        Exit::Exited(status) => {
            // Lines written right before the exit may still be buffered
            if !output_closed {
                let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
                while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, lines.next()).await {
                    forward(&shared, frame).await;
                }
            }

            if stop_requested.load(Ordering::SeqCst) {
                (
                    TunnelState::Stopped,
                    format!("Tunnel process exited ({})", describe(status)),
                )
            } else {
                (
                    TunnelState::Failed,
                    format!("Tunnel process exited unexpectedly ({})", describe(status)),
                )
            }
        }
    };

    if next == TunnelState::Failed {
        tracing::error!("{}", message);
    } else {
        tracing::info!("{}", message);
    }

    if shared.state().is_active() {
        shared.transition(next, Some(message.clone())).await;
    }
    shared.notifier.log_line(message).await;
}

/// How the read loop ended
enum Exit {
    Exited(Option<ExitStatus>),
    Forced,
}

async fn forward(shared: &Shared, frame: Result<impl AsRef<[u8]>, impl std::fmt::Display>) {
    let raw = match frame {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!("Error reading tunnel output: {}", e);
            shared.notifier.log_line(format!("Read error: {}", e)).await;
            return;
        }
    };

    let line = decode_line(raw.as_ref());
    if line.lossy {
        tracing::debug!("DecodeFallback: tunnel output was not valid UTF-8");
    }
    tracing::debug!("tunnel: {}", line.text);

    let announced = parse_forwarding(&line.text);
    shared.notifier.log_line(line.text).await;
    if let Some(url) = announced {
        shared.announce(url).await;
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::warn!("Failed to kill tunnel process: {}", e);
    }
    if reap(child).await.is_none() {
        tracing::warn!("Killed tunnel process was not reaped within {:?}", REAP_TIMEOUT);
    }
}

async fn reap(child: &mut Child) -> Option<ExitStatus> {
    tokio::time::timeout(REAP_TIMEOUT, child.wait())
        .await
        .ok()
        .and_then(Result::ok)
}

fn describe(status: Option<ExitStatus>) -> String {
    match status {
        Some(status) => status.to_string(),
        None => "exit status unknown".to_string(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::notify::{self, Notification, NotificationQueue};
    use crate::testing::mock_tool;

    fn supervisor(tool: TunnelTool, stop_timeout: Duration) -> (TunnelSupervisor, NotificationQueue) {
        let (notifier, queue) = notify::channel(256);
        (TunnelSupervisor::new(tool, notifier, stop_timeout), queue)
    }

    async fn wait_for_state(supervisor: &TunnelSupervisor, state: TunnelState) {
        let mut rx = supervisor.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.state == state))
            .await
            .expect("timed out waiting for tunnel state")
            .unwrap();
    }

    fn drain(queue: &mut NotificationQueue) -> Vec<Notification> {
        std::iter::from_fn(|| queue.try_next()).collect()
    }

    fn log_lines(events: &[Notification]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|n| match n {
                Notification::TunnelLogLine(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_forwarding_line_sets_public_address() {
        let (_dir, tool) = mock_tool(
            "echo 'Tunnel Status  online'\necho 'Forwarding https://abc123.example.com -> 127.0.0.1:5000'\nexec sleep 30",
        );
        let (mut supervisor, mut queue) = supervisor(tool, DEFAULT_STOP_TIMEOUT);

        supervisor
            .start(TunnelProtocol::Http, "127.0.0.1:5000", "token")
            .await
            .unwrap();
        wait_for_state(&supervisor, TunnelState::Running).await;

        assert_eq!(
            supervisor.public_address().as_deref(),
            Some("https://abc123.example.com")
        );

        supervisor.stop().await;
        assert_eq!(supervisor.status(), TunnelStatus::default());

        let events = drain(&mut queue);
        let lines = log_lines(&events);
        let online = lines.iter().position(|l| *l == "Tunnel Status  online").unwrap();
        let forwarding = lines.iter().position(|l| l.starts_with("Forwarding")).unwrap();
        assert!(online < forwarding);
        assert!(events.contains(&Notification::PublicAddressChanged(Some(
            "https://abc123.example.com".to_string()
        ))));
        assert_eq!(
            events.last(),
            Some(&Notification::TunnelLogLine(
                lines.last().unwrap().to_string()
            ))
        );
        assert!(lines.last().unwrap().starts_with("Tunnel process exited"));
    }

    #[tokio::test]
    async fn test_unexpected_exit_fails_tunnel() {
        let (_dir, tool) = mock_tool("echo 'boom'\nexit 3");
        let (mut supervisor, mut queue) = supervisor(tool, DEFAULT_STOP_TIMEOUT);

        supervisor
            .start(TunnelProtocol::Http, "127.0.0.1:5000", "token")
            .await
            .unwrap();
        wait_for_state(&supervisor, TunnelState::Failed).await;

        // The terminal line is sent right after the transition
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(supervisor.public_address(), None);

        let events = drain(&mut queue);
        assert!(events.contains(&Notification::TunnelStateChanged {
            state: TunnelState::Failed,
            detail: Some(
                log_lines(&events)
                    .last()
                    .unwrap()
                    .to_string()
            ),
        }));
        assert!(log_lines(&events)
            .last()
            .unwrap()
            .starts_with("Tunnel process exited unexpectedly"));

        supervisor.stop().await;
        assert_eq!(supervisor.state(), TunnelState::Stopped);
    }

    #[tokio::test]
    async fn test_failure_after_running_clears_address() {
        let (_dir, tool) = mock_tool("echo 'Forwarding https://x.example.com -> 127.0.0.1:5000'\nsleep 1\nexit 1");
        let (mut supervisor, mut queue) = supervisor(tool, DEFAULT_STOP_TIMEOUT);

        supervisor
            .start(TunnelProtocol::Http, "127.0.0.1:5000", "token")
            .await
            .unwrap();
        wait_for_state(&supervisor, TunnelState::Running).await;
        wait_for_state(&supervisor, TunnelState::Failed).await;
        assert_eq!(supervisor.public_address(), None);

        let events = drain(&mut queue);
        assert!(events.contains(&Notification::PublicAddressChanged(None)));
    }

    #[tokio::test]
    async fn test_reannouncement_updates_address() {
        let (_dir, tool) = mock_tool(
            "echo 'Forwarding https://first.example.com -> 127.0.0.1:5000'\necho 'Forwarding https://second.example.com -> 127.0.0.1:5000'\nexec sleep 30",
        );
        let (mut supervisor, _queue) = supervisor(tool, DEFAULT_STOP_TIMEOUT);

        supervisor
            .start(TunnelProtocol::Https, "127.0.0.1:5000", "token")
            .await
            .unwrap();
        let mut rx = supervisor.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.public_address.as_deref() == Some("https://second.example.com")),
        )
        .await
        .unwrap()
        .unwrap();

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_forwarded_with_substitution() {
        let (_dir, tool) = mock_tool("printf 'bad \\377 byte\\n'\nexec sleep 30");
        let (mut supervisor, mut queue) = supervisor(tool, DEFAULT_STOP_TIMEOUT);

        supervisor
            .start(TunnelProtocol::Http, "127.0.0.1:5000", "token")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(supervisor.state(), TunnelState::Starting);
        supervisor.stop().await;

        let events = drain(&mut queue);
        assert!(log_lines(&events).contains(&"bad \u{FFFD} byte"));
    }

    #[tokio::test]
    async fn test_rejected_token_is_synchronous() {
        let (_dir, tool) = mock_tool("exec sleep 30");
        let (mut supervisor, _queue) = supervisor(tool, DEFAULT_STOP_TIMEOUT);

        let result = supervisor
            .start(TunnelProtocol::Http, "127.0.0.1:5000", "bad")
            .await;
        assert!(matches!(result, Err(TunnelError::AuthConfig(ref reason)) if reason == "invalid token"));
        assert_eq!(supervisor.state(), TunnelState::Stopped);
    }

    #[tokio::test]
    async fn test_hung_process_is_force_killed() {
        // `kill` is ignored by this instance
        let (_dir, tool) = mock_tool("rm -f \"$(dirname \"$0\")/pid\"\nexec sleep 30");
        let (mut supervisor, mut queue) = supervisor(tool, Duration::from_millis(300));

        supervisor
            .start(TunnelProtocol::Http, "127.0.0.1:5000", "token")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        tokio::time::timeout(Duration::from_secs(5), supervisor.stop())
            .await
            .expect("stop must be bounded");
        assert_eq!(supervisor.state(), TunnelState::Stopped);

        let events = drain(&mut queue);
        assert!(log_lines(&events)
            .iter()
            .any(|l| l.contains("forcibly terminated")));
    }

    #[tokio::test]
    async fn test_exit_detected_while_grandchild_holds_output() {
        let (_dir, tool) = mock_tool(
            "echo 'Forwarding https://orphan.example.com -> 127.0.0.1:5000'\nsleep 8 &\nsleep 0.3\nexit 3",
        );
        let (mut supervisor, mut queue) = supervisor(tool, DEFAULT_STOP_TIMEOUT);

        supervisor
            .start(TunnelProtocol::Http, "127.0.0.1:5000", "token")
            .await
            .unwrap();
        wait_for_state(&supervisor, TunnelState::Failed).await;
        assert_eq!(supervisor.public_address(), None);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let events = drain(&mut queue);
        let lines = log_lines(&events);
        assert!(lines.iter().any(|l| l.starts_with("Forwarding")));
        assert!(lines
            .last()
            .unwrap()
            .starts_with("Tunnel process exited unexpectedly"));

        tokio::time::timeout(Duration::from_secs(2), supervisor.stop())
            .await
            .expect("stop after failure must not wait for the grandchild");
        assert_eq!(supervisor.state(), TunnelState::Stopped);
    }

    #[tokio::test]
    async fn test_forced_stop_bounded_while_grandchild_holds_output() {
        // Ignores `kill`, and the foreground `sleep` keeps stdout open after the shell dies
        let (_dir, tool) = mock_tool("rm -f \"$(dirname \"$0\")/pid\"\nsleep 8\nexit 0");
        let (mut supervisor, mut queue) = supervisor(tool, Duration::from_millis(300));

        supervisor
            .start(TunnelProtocol::Http, "127.0.0.1:5000", "token")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(4), supervisor.stop())
            .await
            .expect("forced stop must be bounded");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(supervisor.status(), TunnelStatus::default());

        let events = drain(&mut queue);
        assert!(events.contains(&Notification::TunnelStateChanged {
            state: TunnelState::Stopped,
            detail: Some(FORCED_MESSAGE.to_string()),
        }));
        assert!(log_lines(&events).contains(&FORCED_MESSAGE));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (_dir, tool) = mock_tool("exec sleep 30");
        let (mut supervisor, mut queue) = supervisor(tool, DEFAULT_STOP_TIMEOUT);

        supervisor.stop().await;
        assert!(drain(&mut queue).is_empty());

        supervisor
            .start(TunnelProtocol::Http, "127.0.0.1:5000", "token")
            .await
            .unwrap();
        supervisor.stop().await;
        drain(&mut queue);

        supervisor.stop().await;
        assert!(drain(&mut queue).is_empty());
        assert_eq!(supervisor.state(), TunnelState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let (_dir, tool) = mock_tool("echo 'Forwarding https://again.example.com -> 127.0.0.1:5000'\nexec sleep 30");
        let (mut supervisor, _queue) = supervisor(tool, DEFAULT_STOP_TIMEOUT);

        for _ in 0..2 {
            supervisor
                .start(TunnelProtocol::Http, "127.0.0.1:5000", "token")
                .await
                .unwrap();
            wait_for_state(&supervisor, TunnelState::Running).await;
            supervisor.stop().await;
            assert_eq!(supervisor.state(), TunnelState::Stopped);
        }
    }
}
