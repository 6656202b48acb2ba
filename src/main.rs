use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use chatflow::config::AppConfig;
use chatflow::pipeline::processor::{ChannelSink, MessagePipeline, OutgoingReply};
use chatflow::pipeline::types::Envelope;

/// Extra wait after stdin closes so the last windows can flush.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries replies.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = AppConfig::from_env();
    config.validate()?;

    eprintln!("chatflow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Window: {} ms", config.aggregator_window.as_millis());
    eprintln!("   Profiles: {}", config.profiles_dir.display());
    eprintln!(
        "   Webhook: {} (timeout {} ms, {} tier / {} lang routes)",
        config.webhook.default_url.as_deref().unwrap_or("no default"),
        config.webhook.timeout.as_millis(),
        config.webhook.tier_urls.len(),
        config.webhook.lang_urls.len(),
    );
    eprintln!("   Reading envelopes from stdin (one JSON object per line).\n");

    let flush_wait = config.aggregator_window + SHUTDOWN_GRACE;
    let drain_wait = config.webhook.timeout + SHUTDOWN_GRACE;

    let (reply_tx, mut reply_rx) = mpsc::channel::<OutgoingReply>(256);
    let pipeline = MessagePipeline::from_config(config, Arc::new(ChannelSink::new(reply_tx)));

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(reply) = reply_rx.recv().await {
            let line = match serde_json::to_string(&reply) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(chat = %reply.chat_jid, error = %e, "Failed to encode reply");
                    continue;
                }
            };
            if let Err(e) = write_line(&mut stdout, &line).await {
                tracing::error!(error = %e, "Failed to write reply to stdout");
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => handle_line(&pipeline, &line),
                None => break,
            },
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted, abandoning open batches");
                return Ok(());
            }
        }
    }

    tracing::info!(
        open_batches = pipeline.aggregator().active_chats(),
        "Input closed, waiting for open batches"
    );
    tokio::time::sleep(flush_wait).await;
    drop(pipeline);

    // The sender lives on until in-flight answers finish.
    if tokio::time::timeout(drain_wait, writer).await.is_err() {
        tracing::warn!("Timed out waiting for in-flight replies");
    }

    Ok(())
}

fn handle_line(pipeline: &MessagePipeline, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    match serde_json::from_str::<Envelope>(line) {
        Ok(envelope) => {
            if let Err(e) = pipeline.ingest(envelope) {
                tracing::warn!(error = %e, "Rejected envelope");
            }
        }
        Err(e) => tracing::warn!(error = %e, "Skipping malformed envelope"),
    }
}

async fn write_line(stdout: &mut tokio::io::Stdout, line: &str) -> std::io::Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
