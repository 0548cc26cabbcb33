//! Constants used throughout the console

/// How often pending notifications are printed
pub const DRAIN_INTERVAL_MS: u64 = 100;

/// Emoji constants for consistent output
pub mod emoji {
    pub const SUCCESS: &str = "✅";
    pub const ERROR: &str = "❌";
    pub const INFO: &str = "📊";
    pub const FOLDER: &str = "📁";
    pub const FILE: &str = "📄";
    pub const SERVER: &str = "🖥️";
    pub const TUNNEL: &str = "🌐";
    pub const LINK: &str = "🔗";
    pub const LOG: &str = "📜";
}

/// Usage messages for commands
pub mod usage {
    pub const ADD: &str = "Usage: add <path>\n\nAdds a file, or every file inside a folder.";
    pub const RM: &str = "Usage: rm <path>\n\nTip: Use ls to see the listed paths.";
    pub const START: &str = "Usage: start [port]";
    pub const TUNNEL: &str = "Usage: tunnel [http|https|tcp|tls] [local-address]";
}
