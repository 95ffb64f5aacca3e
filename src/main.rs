//! BitChat CLI entry point
//!
//! Brings up a node on the BLE mesh (or refuses politely when the build
//! lacks Bluetooth support) and prints events to stdout.

use std::sync::Arc;

use clap::Parser;

use bitchat::config::BitchatConfig;
use bitchat::crypto::BitchatIdentity;
use bitchat::keystore::{load_or_generate, MemoryIdentityStore};
use bitchat::Result;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log filter directive (overrides BITCHAT_LOG)
    #[arg(short, long)]
    verbosity: Option<String>,

    /// Nickname hint carried in announce beacons
    #[arg(short, long)]
    nickname: Option<String>,

    /// Reduce RF footprint (short scans, slow announces)
    #[arg(long)]
    low_visibility: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = BitchatConfig::from_env();
    if let Some(nickname) = args.nickname {
        config.nickname = nickname;
    }
    if args.low_visibility {
        config.low_visibility = true;
    }
    let filter = args.verbosity.unwrap_or_else(|| config.log_filter.clone());

    use tracing_subscriber::{fmt, EnvFilter};
    fmt().with_env_filter(EnvFilter::new(&filter)).init();

    tracing::info!("Starting BitChat...");

    // Ephemeral identity unless a platform key store is wired in
    let identity = Arc::new(load_or_generate(&MemoryIdentityStore::new())?);

    run(identity, config).await
}

#[cfg(feature = "bluetooth")]
async fn run(identity: Arc<BitchatIdentity>, config: BitchatConfig) -> Result<()> {
    use bitchat::app::{BitchatApp, Command};
    use bitchat::transport::ble::BleTransport;
    use bitchat::transport::BleTransportConfig;

    let ble_config = BleTransportConfig::builder()
        .mtu_ceiling(config.mtu_ceiling)
        .low_visibility(config.low_visibility)
        .build();
    let transport = BleTransport::new(identity.peer_id(), ble_config).await?;

    let app = BitchatApp::new(identity, transport, config);
    app.start().await?;
    app.submit(Command::Announce { nickname: None })?;

    let mut events = app.events().expect("first consumer");
    while let Some(event) = events.recv().await {
        println!("{:?}", event);
    }
    Ok(())
}

#[cfg(not(feature = "bluetooth"))]
async fn run(_identity: Arc<BitchatIdentity>, _config: BitchatConfig) -> Result<()> {
    tracing::error!("built without the `bluetooth` feature; no transport available");
    Ok(())
}
