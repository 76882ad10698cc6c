//! Inspect the shared state for one account: tracked tokens, lease owner,
//! DesiredSet membership.
//!
//! Usage: cargo run --bin check_tracked_tokens -- <ACCOUNT> [--redis-url redis://...]

use anyhow::Result;
use clap::Parser;
use wallet_tracker::{
    config::Settings,
    store::{CoordinationStore, RedisStore},
    tokens::TrackedTokens,
};

#[derive(Parser, Debug)]
#[command(about = "Show what the tracker knows about an account")]
struct Args {
    /// Account public key.
    account: String,

    /// Overrides the configured store.
    #[arg(long)]
    redis_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut settings = Settings::load()?;
    if let Some(url) = args.redis_url {
        settings.redis_url = url;
    }

    println!("🔍 Checking {} on {}", args.account, settings.redis_url);
    let store = std::sync::Arc::new(RedisStore::connect(&settings.redis_url).await?);
    let keys = settings.keys.clone();

    let desired = store.set_members(&keys.desired_set).await?;
    let owner = store.get(&keys.lease_key(&args.account)).await?;
    println!("   In {}: {}", keys.desired_set, desired.contains(&args.account));
    println!("   Lease owner: {}", owner.as_deref().unwrap_or("none"));

    let tokens = TrackedTokens::new(store, keys, settings.tracked_tokens_ttl());
    match tokens.get(&args.account).await? {
        None => println!("❌ No tracked-token map (account not tracked)"),
        Some(map) if map.is_empty() => println!("📭 Tracked, no tokens held"),
        Some(map) => {
            println!("\n💰 {} token(s):", map.len());
            for (mint, record) in &map {
                let usd = if record.usd_value.is_finite() {
                    format!("${:.4}", record.usd_value)
                } else {
                    "n/a".to_string()
                };
                println!("   {:<8} {:>20} {:>14}  {}", record.symbol, record.balance, usd, mint);
            }
        }
    }

    Ok(())
}
