//! FriendHub - Friend Presence Notifications
//!
//! A small presence hub: clients log in with a friend list over TCP or UDP,
//! heartbeat, and get told when their friends come online or go offline.

mod config;
mod hub;
mod network;
mod protocol;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::oneshot;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use hub::{spawn_ticker, Hub};
use network::{Client, Transport};

/// FriendHub - friend presence notifications
#[derive(Parser)]
#[command(name = "friendhub")]
#[command(author = "FriendHub Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Tell users when their friends come online or go offline", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the presence hub
    Server {
        /// Transport to serve
        #[arg(short, long, value_enum)]
        transport: Option<Transport>,

        /// Address to listen on, e.g. ":8080"
        #[arg(short, long)]
        addr: Option<String>,
    },

    /// Log in as a user and print friend status changes
    Client {
        /// Transport to connect with
        #[arg(short, long, value_enum)]
        transport: Option<Transport>,

        /// Hub address
        #[arg(short, long)]
        addr: Option<String>,

        /// Login payload, e.g. '{"user_id":1, "friends": [2, 3]}'
        #[arg(short, long)]
        user: String,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Server { transport, addr } => {
            run_server(config, transport, addr).await?;
        }
        Commands::Client {
            transport,
            addr,
            user,
        } => {
            run_client(config, transport, addr, user).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                if let Some(path) = output {
                    config::sample_config().save(&path)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", config::generate_sample_config()?);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Run the hub and serve one transport until Ctrl+C or a fatal listener error
async fn run_server(
    config: Config,
    transport: Option<Transport>,
    addr: Option<String>,
) -> anyhow::Result<()> {
    let transport = transport.unwrap_or(config.server.transport);
    let addr = network::with_default_host(
        &addr.unwrap_or_else(|| config.server.bind_address.clone()),
        "0.0.0.0",
    );
    let hub_config = config.server.hub_config();

    tracing::info!(
        "Starting FriendHub on {} over {} (timeout {:?}, check every {:?})",
        addr,
        transport,
        hub_config.heartbeat_timeout,
        hub_config.check_interval
    );

    let (hub, handle) = Hub::new(hub_config.clone());
    let ticks = spawn_ticker(hub_config.check_interval);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let hub_task = tokio::spawn(hub.run(ticks, shutdown_rx));

    let mut listener = network::new_listener(transport, config.server.write_deadline());
    listener.handle(Arc::new(handle));

    let result = tokio::select! {
        result = listener.listen_and_serve(&addr) => result,
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
            Ok(())
        }
    };

    let _ = shutdown_tx.send(());
    let hub = hub_task.await?;
    if hub.is_empty() {
        tracing::info!("Hub stopped with no users online");
    } else {
        let online: Vec<_> = hub.users().keys().collect();
        tracing::info!("Hub stopped with {} users online: {:?}", hub.len(), online);
    }

    result?;
    Ok(())
}

/// Log in and print friend status changes until Ctrl+C or the hub hangs up
async fn run_client(
    config: Config,
    transport: Option<Transport>,
    addr: Option<String>,
    user: String,
) -> anyhow::Result<()> {
    let transport = transport.unwrap_or(config.client.transport);
    let addr = network::with_default_host(
        &addr.unwrap_or_else(|| config.client.server_address.clone()),
        "127.0.0.1",
    );
    let server_addr = network::resolve_addr(&addr).await?;
    let login = network::parse_login(&user)?;

    let mut client = Client::connect(transport, server_addr, &login).await?;
    client.spawn_heartbeat(config.client.heartbeat_interval());

    println!("User {} connected to {} over {}", client.user_id(), client.server_addr(), transport);
    println!("Press Ctrl+C to disconnect.\n");

    loop {
        tokio::select! {
            status = client.next_status() => {
                match status? {
                    Some(status) => {
                        let state = if status.online { "online" } else { "offline" };
                        tracing::info!(friend = status.user_id, online = status.online, "Friend status changed");
                        println!("Friend {} is {}", status.user_id, state);
                    }
                    None => {
                        println!("Hub closed the connection");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    client.close().await?;
    Ok(())
}
