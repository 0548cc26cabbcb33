//! Local file sharing with an optional public tunnel
//!
//! This crate serves a registry of local files over HTTP (with range request
//! support) and can expose that server to the internet by supervising an
//! external tunneling CLI such as cpolar. [`LifecycleCoordinator`] drives both
//! and reports every change through a single ordered notification queue.

mod config;
mod coordinator;
mod error;
mod forwarding;
mod notify;
mod registry;
mod server;
mod state;
mod token;
mod tool;
mod tunnel;
mod utils;

#[cfg(test)]
mod testing;

pub use config::{Config, DEFAULT_PORT};
pub use coordinator::{CoordinatorOptions, LifecycleCoordinator};
pub use error::{Error, Result, ServeError, TunnelError, UserMessage};
pub use forwarding::{decode_line, parse_forwarding, DecodedLine, FORWARDING_MARKER};
pub use notify::{dispatch, Notification, NotificationQueue, Notifier, Presenter};
pub use registry::{FileDescriptor, FileRegistry, Snapshot};
pub use server::{EndpointOptions, ProbePolicy, ServingEndpoint};
pub use state::{ServerState, TunnelProtocol, TunnelState};
pub use token::{generate_shutdown_token, verify_shutdown_token};
pub use tool::{TunnelTool, DEFAULT_TOOL};
pub use tunnel::{TunnelStatus, TunnelSupervisor, DEFAULT_STOP_TIMEOUT};
pub use utils::{collect_files, format_size, local_ip};
