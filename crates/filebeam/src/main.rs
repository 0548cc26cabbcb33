mod commands;
mod constants;
mod presenter;

use commands::Command;
use constants::{emoji, DRAIN_INTERVAL_MS};
use fileserver::{Config, CoordinatorOptions, LifecycleCoordinator, NotificationQueue};
use presenter::ConsolePresenter;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    let _ = dotenv::dotenv();
    init_tracing();

    let config = Config::from_env();
    let (coordinator, mut queue) =
        LifecycleCoordinator::new(CoordinatorOptions::from(&config)).await;
    let mut presenter = ConsolePresenter;

    println!("FileBeam started. Type help to see the commands.");
    if !coordinator.tool_installed() {
        println!(
            "{} '{}' was not found, tunneling is unavailable",
            emoji::ERROR,
            config.tunnel_bin
        );
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tick = tokio::time::interval(Duration::from_millis(DRAIN_INTERVAL_MS));
    let mut tasks = JoinSet::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match Command::parse(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => {
                        tasks.spawn(commands::execute(command, coordinator.clone(), config.clone()));
                    }
                    Ok(None) => {}
                    Err(message) => println!("{} {}", emoji::ERROR, message),
                },
                Ok(None) => {
                    tracing::debug!("stdin closed");
                    break;
                }
                Err(e) => {
                    tracing::error!("Failed to read stdin: {}", e);
                    break;
                }
            },
            Some(result) = tasks.join_next() => {
                if let Err(e) = result {
                    tracing::error!("Command task failed: {}", e);
                }
            }
            _ = tick.tick() => {
                queue.drain_into(&mut presenter);
            }
            _ = &mut ctrl_c => {
                println!();
                break;
            }
        }
    }

    // Let running commands finish so shutdown sees a settled state
    while !tasks.is_empty() {
        tokio::select! {
            _ = tasks.join_next() => {}
            _ = tick.tick() => {
                queue.drain_into(&mut presenter);
            }
        }
    }

    let quitting = commands::execute(Command::Quit, coordinator.clone(), config.clone());
    drain_while(quitting, &mut queue, &mut presenter, &mut tick).await;
    println!("{} Bye!", emoji::SUCCESS);
}

/// Run `work` to completion while still printing what happens
async fn drain_while(
    work: impl std::future::Future<Output = ()>,
    queue: &mut NotificationQueue,
    presenter: &mut ConsolePresenter,
    tick: &mut tokio::time::Interval,
) {
    tokio::pin!(work);
    loop {
        tokio::select! {
            _ = &mut work => break,
            _ = tick.tick() => {
                queue.drain_into(presenter);
            }
        }
    }
    queue.drain_into(presenter);
}

/// Install the tracing subscriber
///
/// Logs go to stderr so they do not interleave with console output.
/// `RUST_LOG` overrides the default `info` filter and
/// `FILEBEAM_LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match std::env::var("FILEBEAM_LOG_FORMAT").as_deref() {
        Ok("json") => builder.json().init(),
        _ => builder.init(),
    }
}
