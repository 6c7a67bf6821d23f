//! Ricart - name server, fortune peer and fortune client.
//!
//! `ricart name-server` runs the directory peers register with,
//! `ricart peer` joins a fortune group and serves until Ctrl+C, and
//! `ricart client` reads or writes fortunes through any peer.

mod client;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ricart_core::peer::resolve_address;
use ricart_core::{FortuneNode, NameServer, NodeConfig, OrbConfig, PeerTypes};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "ricart")]
#[command(about = "Object request broker with a token-passing distributed lock")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the name service
    NameServer {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value_t = OrbConfig::DEFAULT_NAME_SERVICE_PORT)]
        port: u16,
    },

    /// Join a fortune group and serve until interrupted
    Peer {
        /// Host to advertise (empty = this machine's host name)
        #[arg(long, default_value = "")]
        host: String,

        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Name service address
        #[arg(short, long, default_value = "127.0.0.1:8000")]
        name_service: String,

        /// Fortune database shared by the group
        #[arg(long, default_value = "fortunes.db")]
        database: PathBuf,

        /// Peer type used to find the rest of the group
        #[arg(long = "type", default_value = PeerTypes::FORTUNE)]
        peer_type: String,
    },

    /// Read or write fortunes through a peer
    Client {
        /// Peer address
        #[arg(value_name = "ADDR:PORT")]
        address: String,

        /// Write a new fortune to the database
        #[arg(short, long, value_name = "FORTUNE")]
        write: Option<String>,

        /// Interactive session with the fortune database
        #[arg(short, long)]
        interactive: bool,

        /// Print the lock status of the peer
        #[arg(short, long)]
        status: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.command {
        Command::NameServer { host, port } => {
            let addr = resolve_address(&format!("{}:{}", host, port)).await?;
            let mut handle = NameServer::serve(addr).await?;
            info!("Name service running on {}", handle.addr());

            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received, exiting");
            handle.shutdown();
        }
        Command::Peer {
            host,
            port,
            name_service,
            database,
            peer_type,
        } => {
            let config = NodeConfig {
                peer_type,
                host,
                port,
                name_service,
                database,
            };
            let node = FortuneNode::start(&config).await?;
            info!("Peer {} serving on {}", node.id(), node.address());

            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received, leaving the group");
            node.destroy().await?;
        }
        Command::Client {
            address,
            write,
            interactive,
            status,
        } => {
            let addr = resolve_address(&address).await?;
            if interactive {
                client::interactive(addr).await?;
            } else if status {
                client::status(addr).await?;
            } else if let Some(fortune) = write {
                client::write(addr, &fortune).await?;
            } else {
                client::read(addr).await?;
            }
        }
    }

    Ok(())
}
