use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::LevelFilter;
use simple_logger::SimpleLogger;
use thiserror::Error;

use wgfleet_core::config::{ConfigError, FleetConfig};

mod client;
mod daemon;
mod protocol;

use protocol::{Request, Response};

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Client(#[from] client::ClientError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "wgfleet", version, about = "Manage a fleet of single-peer WireGuard tunnels")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(long, global = true, help = "Path to conf.yml")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Path to the daemon's control socket")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon: owns every tunnel for the lifetime of the process.
    Run,
    /// Allocate resources, write a `.conf`, and bring a tunnel up.
    Open {
        tunnel_id: String,
        peer_endpoint: String,
        peer_port: u16,
        peer_public_key: String,
        #[arg(long, default_value_t = 3600)]
        ttl_secs: u64,
    },
    /// Tear a tunnel down and release its resources.
    Close { tunnel_id: String },
    /// Push a tunnel's expiry further into the future.
    Extend { tunnel_id: String, by_secs: u64 },
    /// List every tunnel id the daemon currently holds.
    List,
    /// Show a single tunnel's live status.
    Show { tunnel_id: String },
}

fn default_socket_path() -> PathBuf {
    wgfleet_core::config::expand_tilde("~/.local/share/wgfleet/wgfleet.sock")
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    SimpleLogger::new()
        .with_level(if cli.verbose { LevelFilter::Debug } else { LevelFilter::Info })
        .init()
        .unwrap_or_else(|e| eprintln!("logger init failed: {e}"));

    match entrypoint(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn entrypoint(cli: Cli) -> Result<(), CommandError> {
    let config_path = cli.config.unwrap_or_else(FleetConfig::default_path);
    let socket_path = cli.socket.unwrap_or_else(default_socket_path);

    match cli.command {
        Command::Run => {
            let config = FleetConfig::load_or_default(&config_path)?;
            daemon::run(config, socket_path).await?;
        }
        Command::Open {
            tunnel_id,
            peer_endpoint,
            peer_port,
            peer_public_key,
            ttl_secs,
        } => {
            client::send(
                &socket_path,
                Request::Open {
                    tunnel_id,
                    peer_endpoint,
                    peer_port,
                    peer_public_key,
                    ttl_secs,
                },
            )
            .await?;
            println!("opened");
        }
        Command::Close { tunnel_id } => {
            client::send(&socket_path, Request::Close { tunnel_id }).await?;
            println!("closed");
        }
        Command::Extend { tunnel_id, by_secs } => {
            client::send(&socket_path, Request::Extend { tunnel_id, by_secs }).await?;
            println!("extended");
        }
        Command::List => {
            if let Response::List(ids) = client::send(&socket_path, Request::List).await? {
                for id in ids {
                    println!("{id}");
                }
            }
        }
        Command::Show { tunnel_id } => {
            if let Response::Status(status) = client::send(&socket_path, Request::Show { tunnel_id }).await? {
                println!(
                    "{} ({}): {} rx={} tx={} latest_handshake={}",
                    status.tunnel_id,
                    status.interface_id,
                    status.state,
                    status.rx_packets,
                    status.tx_packets,
                    status.latest_handshake
                );
            }
        }
    }

    Ok(())
}
