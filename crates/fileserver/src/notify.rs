//! Ordered notification channel from background work to the presentation layer
//!
//! Background tasks never touch presentation state. They push
//! [`Notification`]s onto one bounded queue and the single-threaded
//! presentation loop drains it with [`NotificationQueue::drain_into`] on each
//! of its iterations.

use crate::registry::Snapshot;
use crate::state::{ServerState, TunnelState};
use tokio::sync::mpsc;

/// Default queue capacity
pub const DEFAULT_CAPACITY: usize = 256;

/// Something the presentation layer should reflect
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    FileListChanged(Snapshot),
    ServerStateChanged {
        state: ServerState,
        detail: Option<String>,
    },
    TunnelStateChanged {
        state: TunnelState,
        detail: Option<String>,
    },
    TunnelLogLine(String),
    PublicAddressChanged(Option<String>),
}

/// Callbacks the presentation layer implements
///
/// All methods default to doing nothing.
pub trait Presenter {
    fn on_file_list_changed(&mut self, _files: &Snapshot) {}
    fn on_server_state_changed(&mut self, _state: ServerState, _detail: Option<&str>) {}
    fn on_tunnel_state_changed(&mut self, _state: TunnelState, _detail: Option<&str>) {}
    fn on_tunnel_log_line(&mut self, _text: &str) {}
    fn on_public_address_changed(&mut self, _url: Option<&str>) {}
}

/// Sending half, cloned into every background context
#[derive(Clone, Debug)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
}

impl Notifier {
    /// Queue a notification, waiting for room when the queue is full
    ///
    /// A closed queue means nobody is presenting anymore; the notification is
    /// dropped.
    pub async fn send(&self, notification: Notification) {
        if self.tx.send(notification).await.is_err() {
            tracing::trace!("Notification queue closed, dropping notification");
        }
    }

    pub async fn server_state(&self, state: ServerState, detail: Option<String>) {
        self.send(Notification::ServerStateChanged { state, detail }).await;
    }

    pub async fn tunnel_state(&self, state: TunnelState, detail: Option<String>) {
        self.send(Notification::TunnelStateChanged { state, detail }).await;
    }

    pub async fn log_line(&self, text: impl Into<String>) {
        self.send(Notification::TunnelLogLine(text.into())).await;
    }

    pub async fn public_address(&self, url: Option<String>) {
        self.send(Notification::PublicAddressChanged(url)).await;
    }

    pub async fn file_list(&self, files: Snapshot) {
        self.send(Notification::FileListChanged(files)).await;
    }
}

/// Receiving half, owned by the presentation layer
#[derive(Debug)]
pub struct NotificationQueue {
    rx: mpsc::Receiver<Notification>,
}

impl NotificationQueue {
    /// Take the next notification if one is ready, without waiting
    pub fn try_next(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next notification
    ///
    /// # Returns
    /// * `None` once every [`Notifier`] is gone
    pub async fn next(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    /// Dispatch everything queued so far to `presenter`, in order
    ///
    /// # Returns
    /// * Number of notifications delivered
    pub fn drain_into<P: Presenter + ?Sized>(&mut self, presenter: &mut P) -> usize {
        let mut delivered = 0;
        while let Some(notification) = self.try_next() {
            dispatch(presenter, &notification);
            delivered += 1;
        }
        delivered
    }
}

/// Route one notification to the matching presenter callback
pub fn dispatch<P: Presenter + ?Sized>(presenter: &mut P, notification: &Notification) {
    match notification {
        Notification::FileListChanged(files) => presenter.on_file_list_changed(files),
        Notification::ServerStateChanged { state, detail } => {
            presenter.on_server_state_changed(*state, detail.as_deref())
        }
        Notification::TunnelStateChanged { state, detail } => {
            presenter.on_tunnel_state_changed(*state, detail.as_deref())
        }
        Notification::TunnelLogLine(text) => presenter.on_tunnel_log_line(text),
        Notification::PublicAddressChanged(url) => presenter.on_public_address_changed(url.as_deref()),
    }
}

/// Create a bounded notification channel
pub fn channel(capacity: usize) -> (Notifier, NotificationQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Notifier { tx }, NotificationQueue { rx })
}
