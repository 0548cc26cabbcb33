//! Console commands

use crate::constants::{emoji, usage};
use fileserver::{format_size, Config, LifecycleCoordinator, TunnelProtocol, UserMessage};
use std::path::Path;

/// Available console commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add(String),
    Rm(String),
    Ls,
    Start(Option<u32>),
    Stop,
    Tunnel {
        protocol: Option<TunnelProtocol>,
        local_address: Option<String>,
    },
    Untunnel,
    Url,
    Status,
    Help,
    Quit,
}

impl Command {
    /// Parse one input line
    ///
    /// # Returns
    /// * `Ok(None)` - blank line
    /// * `Err(message)` - unknown command or bad arguments
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };
        let args: Vec<&str> = rest.split_whitespace().collect();

        let command = match name.to_lowercase().as_str() {
            "" => return Ok(None),
            "add" if !rest.is_empty() => Command::Add(rest.to_string()),
            "add" => return Err(usage::ADD.to_string()),
            "rm" if !rest.is_empty() => Command::Rm(rest.to_string()),
            "rm" => return Err(usage::RM.to_string()),
            "ls" => Command::Ls,
            "start" => match args.as_slice() {
                [] => Command::Start(None),
                [port] => Command::Start(Some(
                    port.parse().map_err(|_| usage::START.to_string())?,
                )),
                _ => return Err(usage::START.to_string()),
            },
            "stop" => Command::Stop,
            "tunnel" => match args.as_slice() {
                [] => Command::Tunnel {
                    protocol: None,
                    local_address: None,
                },
                [protocol] => Command::Tunnel {
                    protocol: Some(protocol.parse()?),
                    local_address: None,
                },
                [protocol, address] => Command::Tunnel {
                    protocol: Some(protocol.parse()?),
                    local_address: Some(address.to_string()),
                },
                _ => return Err(usage::TUNNEL.to_string()),
            },
            "untunnel" => Command::Untunnel,
            "url" => Command::Url,
            "status" => Command::Status,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => {
                return Err(format!(
                    "Unknown command '{}'. Type help to see the usage.",
                    other
                ))
            }
        };
        Ok(Some(command))
    }

    pub fn descriptions() -> &'static str {
        "These commands are supported:\n\
         add <path> - Share a file or every file in a folder\n\
         rm <path> - Stop sharing a file\n\
         ls - List shared files\n\
         start [port] - Start the file server\n\
         stop - Stop the file server and the tunnel\n\
         tunnel [protocol] [local-address] - Expose the server publicly\n\
         untunnel - Close the public tunnel\n\
         url - Show the LAN and public addresses\n\
         status - Show server and tunnel state\n\
         help - Display help information\n\
         quit - Stop everything and exit"
    }
}

/// Run a command; `Quit` stops everything
///
/// Coordinator calls may wait on probes and process exits, so callers run
/// this on its own task.
pub async fn execute(command: Command, coordinator: LifecycleCoordinator, config: Config) {
    match command {
        Command::Add(path) => add(&coordinator, &path).await,
        Command::Rm(path) => {
            if coordinator.remove_file(&path).await {
                println!("{} Removed {}", emoji::SUCCESS, path);
            } else {
                println!("{} {} is not in the list", emoji::ERROR, path);
            }
        }
        Command::Ls => list(&coordinator),
        Command::Start(port) => {
            let port = port.unwrap_or(config.port as u32);
            let files = coordinator.files().to_vec();
            if let Err(err) = coordinator.start_serving(port, files).await {
                tracing::error!("Failed to start serving: {}", err);
                println!("{}", err.user_message());
            }
        }
        Command::Stop => coordinator.stop_serving().await,
        Command::Tunnel {
            protocol,
            local_address,
        } => {
            let protocol = protocol.unwrap_or(config.tunnel_protocol);
            if let Err(err) = coordinator
                .start_tunnel(protocol, local_address.as_deref(), &config.tunnel_token)
                .await
            {
                println!("{}", err.user_message());
            }
        }
        Command::Untunnel => coordinator.stop_tunnel().await,
        Command::Url => url(&coordinator).await,
        Command::Status => status(&coordinator),
        Command::Help => println!("{}", Command::descriptions()),
        Command::Quit => coordinator.shutdown().await,
    }
}

async fn add(coordinator: &LifecycleCoordinator, path: &str) {
    let path = Path::new(path);
    if !path.exists() {
        println!("{} {} does not exist", emoji::ERROR, path.display());
        return;
    }

    let added = coordinator.add_path(path).await;
    match added {
        0 => println!("{} Nothing new to add from {}", emoji::INFO, path.display()),
        1 => println!("{} Added 1 file", emoji::SUCCESS),
        n => println!("{} Added {} files", emoji::SUCCESS, n),
    }
}

fn list(coordinator: &LifecycleCoordinator) {
    let files = coordinator.files();
    if files.is_empty() {
        println!("{} No files shared yet. Use add <path>.", emoji::FOLDER);
        return;
    }

    println!("{} {} shared file(s):", emoji::FOLDER, files.len());
    for (index, file) in files.iter().enumerate() {
        println!(
            "  {} [{}] {} ({})\n      {}",
            emoji::FILE,
            index,
            file.name(),
            format_size(file.size_bytes()),
            file.path()
        );
    }
}

async fn url(coordinator: &LifecycleCoordinator) {
    match coordinator.lan_url().await {
        Some(url) => println!("{} LAN: {}", emoji::LINK, url),
        None => println!("{} The server is not running", emoji::ERROR),
    }
    if let Some(url) = coordinator.public_address() {
        println!("{} Public: {}", emoji::TUNNEL, url);
    }
}

fn status(coordinator: &LifecycleCoordinator) {
    println!("{} Status", emoji::INFO);
    println!("  Server: {}", coordinator.server_state());
    if let Some(addr) = coordinator.local_address() {
        println!("  Bound to: {}", addr);
    }
    println!("  Tunnel: {}", coordinator.tunnel_state());
    match coordinator.tool_version() {
        Some(version) => println!("  Tunnel tool: {}", version),
        None => println!("  Tunnel tool: not installed"),
    }
    println!("  Files: {}", coordinator.files().len());
}
