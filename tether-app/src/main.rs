//! tether-app: run one provider from a JSON config file.
//!
//!   cargo run -p tether-app -- provider.json
//!   cargo run -p tether-app -- provider.json sendText '{"to":"alice","text":"hi"}'
//!
//! With a method, one admission-gated message call is made after connecting.
//! The provider then stays up, reconnecting as needed, until Ctrl+C.

use std::time::Duration;

use serde_json::Value;
use tether_client::{Operation, ProviderConfig, ProviderRegistry};

const STATUS_EVERY: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // Override with e.g. RUST_LOG=tether_client=debug
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("tether_client=info,tether_app=info"),
    )
    .init();

    if let Err(e) = run().await {
        eprintln!("\n✗ {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => ProviderConfig::load(path)?,
        None => {
            log::info!("[tether-app] No config file given, using defaults");
            ProviderConfig::default()
        }
    };
    let method = args.next();
    let params: Value = match args.next() {
        Some(raw) => serde_json::from_str(&raw)?,
        None      => Value::Null,
    };

    let registry = ProviderRegistry::with_defaults();
    let provider = registry.create(&config)?;
    println!("🔌 Connecting {} provider to {} …", provider.name(), config.address);
    provider.start().await?;
    println!("✅ Connected");

    if let Some(method) = method {
        match provider.execute(Operation::Message, &method, params).await {
            Ok(result) => println!("📨 {method} → {result}"),
            Err(e) if e.is_denial() => println!("⛔ {method} refused: {e}"),
            Err(e) => println!("✗ {method} failed: {e}"),
        }
    }

    println!("\n👂 Running (Ctrl+C to quit) …\n");
    let mut status = tokio::time::interval(STATUS_EVERY);
    status.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = status.tick() => {
                let state = if provider.is_connected() { "up" } else { "down" };
                log::info!("[tether-app] {} link {state}", provider.name());
            }
        }
    }

    provider.stop().await;
    println!("👋 Stopped");
    Ok(())
}
