//! Console rendering of coordinator notifications

use crate::constants::emoji;
use fileserver::{Presenter, ServerState, Snapshot, TunnelState};

/// Prints every notification to stdout
#[derive(Default)]
pub struct ConsolePresenter;

impl Presenter for ConsolePresenter {
    fn on_file_list_changed(&mut self, files: &Snapshot) {
        println!("{} File list updated ({} file(s))", emoji::FOLDER, files.len());
    }

    fn on_server_state_changed(&mut self, state: ServerState, detail: Option<&str>) {
        let icon = match state {
            ServerState::Failed => emoji::ERROR,
            _ => emoji::SERVER,
        };
        match (state, detail) {
            (ServerState::Running, Some(url)) => println!("{} Server running at {}", icon, url),
            (_, Some(detail)) => println!("{} Server {}: {}", icon, state, detail),
            (_, None) => println!("{} Server {}", icon, state),
        }
    }

    fn on_tunnel_state_changed(&mut self, state: TunnelState, detail: Option<&str>) {
        let icon = match state {
            TunnelState::Failed => emoji::ERROR,
            _ => emoji::TUNNEL,
        };
        match detail {
            Some(detail) => println!("{} Tunnel {}: {}", icon, state, detail),
            None => println!("{} Tunnel {}", icon, state),
        }
    }

    fn on_tunnel_log_line(&mut self, line: &str) {
        println!("{} {}", emoji::LOG, line);
    }

    fn on_public_address_changed(&mut self, url: Option<&str>) {
        match url {
            Some(url) => println!("{} Public address: {}", emoji::LINK, url),
            None => println!("{} Public address cleared", emoji::LINK),
        }
    }
}
