//! socks-fleet: stand up and rewire a VPN-over-SOCKS proxy fleet.
//!
//! ## Commands
//!
//! - `network` - Create the isolated network, attach/detach containers
//! - `switch` - Start, stop or rebuild the switch
//! - `proxy` - Run, sample, adopt, list and stop proxy backends
//! - `route` / `disconnect-all` - Manage forwarders inside the switch
//! - `image` - Build or rebuild images
//! - `restart` - Stop OpenVPN proxies, replace the switch, restore routes
//! - `status` - JSON snapshot of the fleet

use clap::{Parser, Subcommand};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;

use socks_fleet::fleet::TunnelKind;
use socks_fleet::images::ImageKind;
use socks_fleet::runtime::DockerRuntime;
use socks_fleet::{Fleet, FleetConfig, FleetError};

mod commands;

/// Exit status for fatal configuration errors.
const EXIT_FATAL: i32 = 2;

// ============================================================================
// CLI Types
// ============================================================================

#[derive(Parser)]
#[command(name = "socks-fleet")]
#[command(about = "VPN-over-SOCKS proxy fleet on Docker", long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/socks-fleet/config.toml)
    #[arg(long, global = true, env = "SOCKS_FLEET_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the isolated network
    Network {
        #[command(subcommand)]
        command: NetworkCommands,
    },

    /// Manage the switch container
    Switch {
        #[command(subcommand)]
        command: SwitchCommands,
    },

    /// Manage proxy backends
    Proxy {
        #[command(subcommand)]
        command: ProxyCommands,
    },

    /// Route a switch port to a backend
    Route {
        /// Backend container name (its alias on the isolated network)
        name: String,

        /// Port to route; the same port is used on the backend
        port: u16,
    },

    /// Kill every forwarder in the switch
    DisconnectAll,

    /// Build images
    Image {
        #[command(subcommand)]
        command: ImageCommands,
    },

    /// Stop OpenVPN proxies, replace the switch and restore surviving routes
    Restart,

    /// Print a JSON snapshot of the fleet
    Status,
}

#[derive(Subcommand)]
enum NetworkCommands {
    /// Create the isolated network unless it exists
    Create,

    /// Connect a running container to the isolated network
    Attach {
        container: String,

        /// DNS alias (repeatable; defaults to the container name)
        #[arg(long)]
        alias: Vec<String>,

        /// Fixed IPv4 address inside the network
        #[arg(long)]
        ip: Option<Ipv4Addr>,
    },

    /// Disconnect a container from the isolated network
    Detach { container: String },
}

#[derive(Subcommand)]
enum SwitchCommands {
    /// Replace any running switch with a fresh one
    Start,

    /// Stop and remove the switch
    Stop,

    /// Stop the switch and rebuild its image
    Rebuild,
}

#[derive(Subcommand)]
enum ProxyCommands {
    /// Start one proxy and route its port
    Run {
        /// Tunnel type
        #[arg(long, value_enum, default_value = "openvpn")]
        kind: TunnelKind,

        /// Container name / hostname
        #[arg(long)]
        name: Option<String>,

        /// Port dedicated to this proxy
        #[arg(long)]
        port: Option<u16>,

        /// OpenVPN config, relative to the VPN directory
        #[arg(long)]
        ovpn: Option<String>,

        /// OpenVPN auth file name
        #[arg(long)]
        ovpn_auth: Option<String>,

        /// WireGuard config, relative to the VPN directory
        #[arg(long)]
        wg_conf: Option<String>,
    },

    /// Replace all OpenVPN proxies with randomly chosen configs
    StartRandom {
        /// Provider subdirectory of the VPN directory
        #[arg(long, default_value = "hma")]
        provider: String,

        /// Auth file name
        #[arg(long, default_value = "hma1")]
        auth: String,

        /// Number of proxies
        #[arg(long, default_value = "5")]
        limit: usize,
    },

    /// Stop and remove proxies
    StopAll {
        /// Which proxies (by their configured name prefix)
        #[arg(long, value_enum, default_value = "openvpn")]
        kind: TunnelKind,

        /// Explicit name prefix, overriding --kind
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Attach a container started elsewhere and route a port to it
    Adopt {
        container: String,

        #[arg(long)]
        port: u16,
    },

    /// List running proxies
    List,
}

#[derive(Subcommand)]
enum ImageCommands {
    /// Build an image
    Build {
        #[arg(value_enum)]
        kind: ImageKind,
    },

    /// Remove then build an image
    Rebuild {
        #[arg(value_enum)]
        kind: ImageKind,
    },
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout carries command output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(e) => {
            error!(error = %e, "Command failed");
            std::process::exit(exit_code(&e));
        }
    }
}

/// Process exit status for a failed command.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<FleetError>() {
        Some(e) if e.is_fatal() => EXIT_FATAL,
        _ => 1,
    }
}

async fn run(cli: Cli) -> anyhow::Result<String> {
    let config = FleetConfig::load(cli.config.as_deref())?;
    let runtime = Arc::new(DockerRuntime::connect()?);
    let fleet = Fleet::new(runtime, config);

    match cli.command {
        Commands::Network { command } => match command {
            NetworkCommands::Create => commands::network::create(&fleet).await,
            NetworkCommands::Attach { container, alias, ip } => {
                commands::network::attach(&fleet, container, alias, ip).await
            }
            NetworkCommands::Detach { container } => {
                commands::network::detach(&fleet, container).await
            }
        },
        Commands::Switch { command } => match command {
            SwitchCommands::Start => commands::switch::start(&fleet).await,
            SwitchCommands::Stop => commands::switch::stop(&fleet).await,
            SwitchCommands::Rebuild => commands::switch::rebuild(&fleet).await,
        },
        Commands::Proxy { command } => match command {
            ProxyCommands::Run {
                kind,
                name,
                port,
                ovpn,
                ovpn_auth,
                wg_conf,
            } => commands::proxy::run(&fleet, kind, name, port, ovpn, ovpn_auth, wg_conf).await,
            ProxyCommands::StartRandom {
                provider,
                auth,
                limit,
            } => commands::proxy::start_random(&fleet, provider, auth, limit).await,
            ProxyCommands::StopAll { kind, prefix } => {
                commands::proxy::stop_all(&fleet, kind, prefix).await
            }
            ProxyCommands::Adopt { container, port } => {
                commands::proxy::adopt(&fleet, container, port).await
            }
            ProxyCommands::List => commands::proxy::list(&fleet).await,
        },
        Commands::Route { name, port } => commands::route::route(&fleet, name, port).await,
        Commands::DisconnectAll => commands::route::disconnect_all(&fleet).await,
        Commands::Image { command } => match command {
            ImageCommands::Build { kind } => commands::image::build(&fleet, kind).await,
            ImageCommands::Rebuild { kind } => commands::image::rebuild(&fleet, kind).await,
        },
        Commands::Restart => commands::status::restart(&fleet).await,
        Commands::Status => commands::status::status(&fleet).await,
    }
}
