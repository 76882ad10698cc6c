//! Run one tracker instance until Ctrl-C.
//!
//! Usage: cargo run --bin wallet_listener

use anyhow::Result;
use log::info;
use wallet_tracker::{config::Settings, service};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(settings.log_level.as_str()))
        .init();
    info!("⚙️ [MAIN] {:?}", settings);

    let tracker = service::start(settings).await?;
    info!("✅ [MAIN] Instance {} running", tracker.instance_id());

    tokio::signal::ctrl_c().await?;
    info!("[MAIN] Ctrl-C received");
    tracker.shutdown().await
}
