//! Job queue worker binary.
//!
//! Runs the queue service with demo analysis and render work functions,
//! pushes one analysis job through it, then serves until Ctrl-C.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vstyle_worker::{
    metrics, work_fn, ProgressReporter, QueueService, SubmitRequest, WorkError, WorkResult,
    WorkerConfig,
};

/// Demo style extraction: walks through a few stages, reporting progress.
async fn extract_style(payload: Value, progress: ProgressReporter) -> WorkResult<Value> {
    let video_id = payload
        .get("videoId")
        .and_then(Value::as_str)
        .ok_or_else(|| WorkError::invalid_payload("videoId is required"))?
        .to_string();

    for step in 1..=4u8 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        progress.report(step * 25)?;
    }

    Ok(json!({
        "videoId": video_id,
        "style": {
            "palette": ["#1b1b1b", "#e0c097", "#5c3d2e"],
            "pacing": "slow",
            "grain": 0.3,
        },
    }))
}

/// Demo template render.
async fn render_template(payload: Value, progress: ProgressReporter) -> WorkResult<Value> {
    let template = payload
        .get("templateId")
        .and_then(Value::as_str)
        .ok_or_else(|| WorkError::invalid_payload("templateId is required"))?
        .to_string();

    for step in 1..=2u8 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        progress.report(step * 50)?;
    }

    Ok(json!({ "templateId": template, "output": format!("renders/{}.mp4", template) }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for rediss:// URLs)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("vstyle=info".parse()?)
        .add_directive("redis=warn".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting vstyle-worker");

    if let Ok(port) = std::env::var("METRICS_PORT") {
        let port: u16 = port.parse().context("METRICS_PORT must be a port number")?;
        metrics::init_metrics(SocketAddr::from(([0, 0, 0, 0], port)))
            .context("Failed to start Prometheus exporter")?;
        info!(port, "Serving Prometheus metrics");
    }

    // Load configuration
    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    let service = QueueService::builder(config)
        .register("analysis", "extract", work_fn(extract_style))
        .register("render", "template", work_fn(render_template))
        .start()
        .await?;
    info!(backend = %service.backend_mode(), "Queue service ready");

    let id = service
        .submit(SubmitRequest::new("analysis", "extract", json!({ "videoId": "v1" })).with_priority(5))
        .await?;

    loop {
        let record = service.get_status(&id).await?;
        info!(job_id = %id, status = %record.status, progress = record.progress, "Polled job");
        if record.is_terminal() {
            match record.result {
                Some(result) => info!(job_id = %id, %result, "Demo job finished"),
                None => warn!(job_id = %id, error = ?record.error, "Demo job did not complete"),
            }
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    for stats in service.stats().await? {
        info!(
            queue = %stats.queue,
            depth = stats.depth,
            workers = stats.workers,
            completed = stats.records.completed,
            failed = stats.records.failed,
            "Queue stats"
        );
    }

    // Wait for shutdown
    tokio::signal::ctrl_c().await.ok();
    info!("Received shutdown signal");

    service.shutdown().await;
    info!("Worker shutdown complete");
    Ok(())
}
