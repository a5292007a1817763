use std::sync::Arc;

use eyre::Context;
use missive::{
    backend::SqliteBackend,
    config::Config,
    message::{MessageType, Priority},
    Pipeline,
};
use tokio::io::{AsyncBufReadExt, BufReader};

const SENDER: &str = "console";

#[tokio::main]
async fn main() -> eyre::Result<()> {
    missive::telemetry::init()?;

    let config = Config::load()?;
    let backend = SqliteBackend::open(config.backend_path())
        .await
        .wrap_err("opening backend")?;

    let pipeline = Pipeline::builder()
        .config(config)
        .backend(Arc::new(backend))
        .connect()
        .await?;
    pipeline.start().await?;

    tracing::info!("reading `receiver:content` lines from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                send_line(&pipeline, &line).await;
            }
        }
    }

    let status = pipeline.queue_status();
    tracing::info!(
        queued = status.queue_length,
        processed = status.metrics.total_processed,
        failed = status.metrics.failed_deliveries,
        "shutting down"
    );
    pipeline.shutdown().await;

    Ok(())
}

async fn send_line(pipeline: &Pipeline, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let Some((receiver, content)) = line.split_once(':') else {
        tracing::warn!(line, "expected `receiver:content`");
        return;
    };

    let content = serde_json::from_str(content.trim())
        .unwrap_or_else(|_| serde_json::Value::String(content.trim().to_owned()));

    match pipeline
        .send_message(
            SENDER,
            receiver.trim(),
            MessageType::Task,
            content,
            Some(Priority::Medium),
        )
        .await
    {
        Ok(accepted) => {
            let status = pipeline.queue_status();
            tracing::info!(
                accepted,
                queued = status.queue_length,
                online = status.is_online,
                "message sent"
            );
        }
        Err(e) => tracing::error!(error = %e, "message rejected"),
    }
}
