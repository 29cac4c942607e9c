// src/main.rs

mod aggregator;
mod annotate;
mod broadcast;
mod camera_worker;
mod clock;
mod clustering;
mod config;
mod detector;
mod layout;
mod pipeline;
mod reid;
mod track;
mod tracker;
mod types;
mod video;

use anyhow::Result;
use pipeline::PipelineOrchestrator;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = types::Config::load(&config_path)?;

    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| format!("mtmc_live={},ort=warn", config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🎥 Multi-Camera Tracking System Starting");
    info!("✓ Configuration loaded from {config_path}");
    info!(
        "Cameras: {} | tick interval: {:.3}s | max skew: {} ticks | viewer port: {}",
        config.cameras.len(),
        config.clock.tick_interval_secs,
        config.clock.max_skew_ticks,
        config.live.port
    );

    PipelineOrchestrator::new(config).run().await
}
