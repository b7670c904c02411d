use std::sync::Arc;

use channel_relay::config::RelayConfig;
use channel_relay::platform::{Platform, TelegramPlatform};
use channel_relay::relay::Relay;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RelayConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export API_ID=... API_HASH=... BOT_TOKEN=...");
        eprintln!("  export SOURCE_CHANNELS=-100123,@drops TARGET_CHANNELS=-100456");
        std::process::exit(1);
    });

    eprintln!("📡 Channel Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Sources: {}",
        config
            .source_channels
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    eprintln!(
        "   Targets: {}",
        config
            .target_channels
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    eprintln!("   Required link: {}", config.filter.required_link);
    eprintln!(
        "   Excluded keywords: {}",
        if config.filter.excluded_keywords.is_empty() {
            "none".to_string()
        } else {
            config.filter.excluded_keywords.join(", ")
        }
    );
    eprintln!(
        "   Media: {:?}, format: {:?}",
        config.filter.media_policy, config.filter.format
    );
    eprintln!(
        "   Pacing: {}/s per channel (burst {}), max {} retries, queue {}\n",
        config.sender.rate_per_sec,
        config.sender.burst,
        config.sender.max_retries,
        config.queue.max_queue,
    );

    let platform = Arc::new(TelegramPlatform::new(config.bot_token.clone()));
    if let Err(e) = platform.health_check().await {
        eprintln!("Error: Telegram health check failed: {e}");
        std::process::exit(1);
    }

    let relay = Relay::from_config(&config, platform)?;
    let mut handle = relay.start().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received");
        }
        _ = handle.inbound_closed() => {
            tracing::warn!("Inbound stream ended");
        }
    }

    let stats = handle.shutdown().await;
    eprintln!(
        "   Relayed {} deliveries ({} failed, {} dropped at shutdown)",
        stats.delivered, stats.failed, stats.abandoned
    );

    Ok(())
}
