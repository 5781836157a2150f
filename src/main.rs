//! Demo binary for tokio-generation-optimizer
//!
//! Builds a [`RequestOptimizer`] over the echo backend, replays a small
//! request mix (repeats, follow-ups on the same session, one bypass), and
//! prints the roll-up metrics and monitor report as JSON.
//!
//! ## Usage
//!
//! ```text
//! optimizer-demo [CONFIG.toml]
//! ```
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON output (production)
//! - `RUST_LOG=info`: log level filter (default: info)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_generation_optimizer::cache::WarmSeed;
use tokio_generation_optimizer::config::loader;
use tokio_generation_optimizer::monitor::LogAlertHandler;
use tokio_generation_optimizer::{
    init_tracing, EchoBackend, GenerationRequest, OptimizerConfig, RequestOptimizer,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = init_tracing();

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => loader::load_from_file(&path)?,
        None => OptimizerConfig::default(),
    };

    let backend = Arc::new(EchoBackend::with_delay(Duration::from_millis(25)));
    let optimizer = RequestOptimizer::new(config, backend)?;
    optimizer
        .monitor()
        .register_alert_handler("log", Arc::new(LogAlertHandler));
    optimizer.start();

    let warmed = optimizer
        .warm(vec![WarmSeed {
            analysis_type: "faq".into(),
            content: "What is the capital of France?".into(),
            result: "Paris is the capital of France.".into(),
            tokens_used: 6,
            quality: 0.9,
        }])
        .await?;
    info!(loaded = warmed.loaded, failed = warmed.failed, "cache warmed");

    let demo_requests = [
        ("session-1", "faq", "What is the capital of France?"),
        ("session-2", "summary", "Explain quantum computing in simple terms."),
        ("session-3", "creative", "Write a haiku about programming."),
        ("session-1", "faq", "What about Germany?"),
        ("session-2", "summary", "Explain quantum computing in simple terms."),
        ("session-4", "summary", "How does photosynthesis work?"),
        ("session-3", "creative", "Write a haiku about programming."),
        ("session-4", "summary", "How does photosynthesis work?"),
    ];

    info!(count = demo_requests.len(), "sending demo requests");
    for (session, analysis_type, content) in demo_requests {
        let request = GenerationRequest::new(session, analysis_type, content);
        match optimizer.optimize(request).await {
            Ok(result) => info!(
                session,
                cache_hit = result.cache_hit,
                optimized = result.optimized,
                worker = ?result.worker,
                quality = result.quality,
                elapsed_ms = result.response_time.as_millis() as u64,
                "request served"
            ),
            Err(e) => warn!(session, error = %e, kind = ?e.kind(), "request failed"),
        }
    }

    let forced = optimizer
        .optimize(
            GenerationRequest::new("session-5", "faq", "What is the capital of France?")
                .bypass_cache(),
        )
        .await?;
    info!(cache_hit = forced.cache_hit, "bypass request served");

    let alerts = optimizer.monitor().evaluate().await;
    info!(alerts = alerts.len(), "alerts evaluated");

    println!("{}", serde_json::to_string_pretty(&optimizer.metrics())?);
    println!("{}", serde_json::to_string_pretty(&optimizer.report())?);
    println!("{}", serde_json::to_string_pretty(&optimizer.cache_statistics())?);

    optimizer.shutdown().await?;
    info!("demo complete");
    Ok(())
}
