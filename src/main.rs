use std::sync::Arc;

use delta_relay::error::log_error;
use delta_relay::init::{open_source, RelayConfig, SourceConfig};
use delta_relay::{relay_stream, render, HttpSurface, StreamReconciler};

// ============================================================================
// Modes
// ============================================================================

async fn run_render(source: &SourceConfig) -> delta_relay::Result<()> {
    let source = open_source(source).await?;
    let mut reconciler = StreamReconciler::new();
    reconciler.process(&source).await?;

    log::info!("✅ Stream reconciled: {:?}", reconciler.stats());
    let state = reconciler.state();
    if state.content.is_empty() {
        log::warn!("⚠️  Stream produced an empty document");
    }
    println!("{}", render(&state.content));
    Ok(())
}

async fn run_relay(source: &SourceConfig) -> delta_relay::Result<()> {
    let config = RelayConfig::from_env()?;
    log::info!("✅ Configuration loaded");
    log::info!("📡 Surface: {}", config.surface.api_url);
    log::info!("💬 Channel: {}", config.target.channel);
    if let Some(thread) = &config.target.thread {
        log::info!("🧵 Thread: {}", thread);
    }

    let surface = Arc::new(HttpSurface::new(&config.surface)?);
    let source = open_source(source).await?;
    let outcome = relay_stream(surface, config.target, source, config.settings).await?;

    log::info!("");
    log::info!("🎉 Relay finished!");
    log::info!("🆔 Run: {}", outcome.run_id);
    log::info!("📍 Message: {}", outcome.resource_id);
    if let Some(chat_id) = &outcome.chat_id {
        log::info!("🔗 Chat: {}", chat_id);
    }
    log::info!(
        "📦 {} batches ({} failed), {} chars",
        outcome.delivery.batches,
        outcome.delivery.failed_batches,
        outcome.delivery.chars_sent
    );
    log::info!("");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    dotenv::dotenv().ok();

    let mode = std::env::args().nth(1).unwrap_or_else(|| "relay".to_string());
    log::info!("🚀 Starting delta relay ({} mode)...", mode);

    let source = SourceConfig::from_env()?;
    let result = match mode.as_str() {
        "render" => run_render(&source).await,
        "relay" => run_relay(&source).await,
        other => {
            eprintln!("usage: delta-relay [relay|render]");
            return Err(format!("unknown mode: {}", other).into());
        }
    };

    if let Err(e) = &result {
        log_error(e);
    }
    Ok(result?)
}
