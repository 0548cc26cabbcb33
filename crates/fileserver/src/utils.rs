//! Utility functions for formatting and host inspection

use crate::registry::FileDescriptor;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::Path;

/// Format file size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes = bytes as f64;
    let unit_index = (bytes.ln() / 1024_f64.ln()).floor() as usize;
    let unit_index = unit_index.min(UNITS.len() - 1);

    let size = bytes / 1024_f64.powi(unit_index as i32);
    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Best guess at this host's LAN address
///
/// Connecting a UDP socket sends nothing; it only makes the OS pick the
/// outbound interface. Falls back to loopback when there is no route.
pub fn local_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        Ok(socket.local_addr()?.ip())
    };

    probe().unwrap_or_else(|e| {
        tracing::debug!("Could not detect LAN address: {}", e);
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    })
}

/// Describe `path`, walking it recursively when it is a directory
///
/// Entries that cannot be read are skipped with a warning.
pub fn collect_files(path: &Path) -> Vec<FileDescriptor> {
    let mut found = Vec::new();
    walk(path, &mut found);
    found
}

fn walk(path: &Path, found: &mut Vec<FileDescriptor>) {
    if path.is_dir() {
        let entries = match std::fs::read_dir(path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Skipping {}: {}", path.display(), e);
                return;
            }
        };

        let mut children: Vec<_> = entries.filter_map(|entry| entry.ok().map(|e| e.path())).collect();
        children.sort();
        for child in children {
            walk(&child, found);
        }
        return;
    }

    match FileDescriptor::from_path(path) {
        Ok(descriptor) => found.push(descriptor),
        Err(e) => tracing::warn!("Skipping {}: {}", path.display(), e),
    }
}
