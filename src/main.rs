mod bus;
mod channel;
mod config;
mod crypto;
mod device;
mod envelope;
mod error;
mod gateway;
mod lorawan;
mod manager;
mod radio;
mod stack;

use clap::Parser;
use gateway::GatewayAdapter;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lorawan-device-sim")]
#[command(about = "LoRaWAN Class-A end-device simulator over a Semtech UDP packet-forwarder bridge")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = config::Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        config::Config::default()
    });

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("lorawan-device-sim v{}", env!("CARGO_PKG_VERSION"));

    let server_addr: std::net::SocketAddr = format!("{}:{}", config.gateway.udp_ip, config.gateway.udp_port).parse()?;
    let eui_bytes = hex::decode(&config.gateway.eui)?;
    let eui: [u8; 8] = eui_bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("gateway.eui must be exactly 8 bytes (16 hex chars)"))?;

    let bus = bus::MessageBus::new();
    let gw = GatewayAdapter::connect(server_addr, eui, bus.clone()).await?;
    gw.start();
    info!(%server_addr, "gateway adapter started");

    let manager = manager::DeviceManager::start(&config, gw, bus).await?;
    info!(devices = manager.device_count(), "device manager started");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, exiting");

    Ok(())
}
