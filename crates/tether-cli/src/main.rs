//! Tether CLI
//!
//! LAN debug-traffic bridge: relay mobile device traffic into a local
//! traffic-inspection proxy.

mod config;

use clap::{Parser, Subcommand};
use config::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tether_core::{ConnectionStore, MemoryConnectionStore, PairingStore, Relay};
use tether_identity::CertificateAuthority;

/// Tether - relay mobile device traffic into an inspection proxy
#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay in the foreground
    Run {
        /// Override the listen address
        #[arg(short, long)]
        listen: Option<String>,

        /// Override the inspection proxy as host:port
        #[arg(short, long)]
        proxy: Option<String>,
    },

    /// Show relay configuration and identity
    Status,

    /// Relay identity operations
    Identity {
        #[command(subcommand)]
        command: IdentityCommands,
    },

    /// Device pairing operations
    Pairings {
        #[command(subcommand)]
        command: PairingCommands,
    },
}

#[derive(Subcommand)]
enum IdentityCommands {
    /// Print the certificate fingerprint clients pin
    Show,
    /// Delete and regenerate the identity (trust reset)
    Reset,
}

#[derive(Subcommand)]
enum PairingCommands {
    /// List known device pairings
    List,
    /// Remove pairings idle for more than 30 days
    Purge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    config.validate()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .init();

    match cli.command {
        Commands::Run { listen, proxy } => {
            if let Some(listen) = listen {
                config.relay.listen_addr = listen;
            }
            if let Some(proxy) = proxy {
                let (host, port) = parse_host_port(&proxy)?;
                config.proxy.host = host;
                config.proxy.port = port;
            }
            config.validate()?;
            run_relay(&config).await?;
        }
        Commands::Status => {
            show_status(&config)?;
        }
        Commands::Identity { command } => match command {
            IdentityCommands::Show => {
                let identity = authority(&config).load_or_generate()?;
                println!("{}", identity.fingerprint());
            }
            IdentityCommands::Reset => {
                let identity = authority(&config).regenerate()?;
                println!("Identity reset. New fingerprint:");
                println!("{}", identity.fingerprint());
                println!("All previously paired devices will alert on their next connection.");
            }
        },
        Commands::Pairings { command } => {
            let pairings = PairingStore::open(config.storage.state_dir.join("pairings.json"))?;
            match command {
                PairingCommands::List => {
                    let mut records = pairings.list();
                    records.sort_by_key(|record| record.last_connected_at);
                    if records.is_empty() {
                        println!("No pairings recorded.");
                    }
                    for record in records {
                        println!(
                            "{}  last seen {}  reliability {:.0}%{}",
                            record.device_id,
                            record.last_connected_at.format("%Y-%m-%d %H:%M"),
                            record.reliability_score() * 100.0,
                            if record.is_expired() { "  (expired)" } else { "" },
                        );
                    }
                }
                PairingCommands::Purge => {
                    let removed = pairings.purge_expired()?;
                    println!("Removed {removed} expired pairing(s).");
                }
            }
        }
    }

    Ok(())
}

fn authority(config: &Config) -> CertificateAuthority {
    CertificateAuthority::new(
        config.storage.state_dir.join("identity"),
        config.relay.device_name.clone(),
    )
}

/// Run the relay until interrupted
async fn run_relay(config: &Config) -> anyhow::Result<()> {
    let store: Arc<dyn ConnectionStore> = Arc::new(MemoryConnectionStore::new());
    let pairing = Arc::new(PairingStore::open(
        config.storage.state_dir.join("pairings.json"),
    )?);

    let relay = Relay::new(
        config.to_relay_config()?,
        authority(config),
        store,
        pairing,
    );

    let addr = match relay.enable().await {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("Failed to start relay: {err}");
            eprintln!("Suggestion: {}", err.recovery_hint());
            return Err(err.into());
        }
    };

    println!("Relay listening on {addr}");
    println!(
        "Forwarding into {}:{}",
        config.proxy.host, config.proxy.port
    );
    if let Some(fingerprint) = relay.fingerprint().await {
        println!("Certificate fingerprint: {fingerprint}");
    }
    println!("Press Ctrl-C to stop.");

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    relay.disable().await;
    Ok(())
}

fn show_status(config: &Config) -> anyhow::Result<()> {
    println!("Listen address:  {}", config.relay.listen_addr);
    println!("Device name:     {}", config.relay.device_name);
    println!(
        "Inspection proxy: {}:{}",
        config.proxy.host, config.proxy.port
    );
    println!(
        "LAN discovery:   {}",
        if config.discovery.enabled { "on" } else { "off" }
    );
    println!("State directory: {}", config.storage.state_dir.display());

    let authority = authority(config);
    if authority.certificate_path().exists() {
        let identity = authority.load_or_generate()?;
        println!("Fingerprint:     {}", identity.fingerprint());
    } else {
        println!("Fingerprint:     (no identity yet; generated on first run)");
    }
    Ok(())
}

fn parse_host_port(value: &str) -> anyhow::Result<(String, u16)> {
    let Some((host, port)) = value.rsplit_once(':') else {
        anyhow::bail!("expected host:port, got '{value}'");
    };
    if host.is_empty() {
        anyhow::bail!("empty host in '{value}'");
    }
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid port in '{value}'"))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port("127.0.0.1:8888").unwrap(),
            ("127.0.0.1".to_string(), 8888)
        );
        assert_eq!(
            parse_host_port("proxy.local:9090").unwrap(),
            ("proxy.local".to_string(), 9090)
        );
        assert!(parse_host_port("no-port").is_err());
        assert!(parse_host_port(":8888").is_err());
        assert!(parse_host_port("host:not-a-port").is_err());
    }
}
