use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;

use danci_affect::config::AffectConfig;
use danci_affect::emotion::EmotionPrediction;
use danci_affect::events::EventEnvelope;
use danci_affect::intervention::Tier;
use danci_affect::logging::init_tracing;
use danci_affect::session::{CapturedFrame, SessionContext};
use danci_affect::store::{FileStore, KeyValueStore, MemoryStore};
use danci_affect::visibility::VisibilitySignal;

/// Cloud predictions are folded in at least this often while stdin is idle.
const CLOUD_DRAIN_INTERVAL: Duration = Duration::from_secs(1);

/// One line of replay input.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrameRecord {
    /// Base64 frame bytes.
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    prediction: Option<EmotionPrediction>,
    #[serde(default)]
    visibility: Option<VisibilitySignal>,
    /// Replay clock in epoch millis; wall clock when absent.
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    evaluate: bool,
    #[serde(default)]
    response: Option<ResponseRecord>,
}

#[derive(Debug, Deserialize)]
struct ResponseRecord {
    tier: Tier,
    accepted: bool,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let config = match AffectConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(2);
        }
    };
    let _log_guard = init_tracing(&config.log_level);

    let store: Arc<dyn KeyValueStore> = match std::env::var("AFFECT_STORE_PATH") {
        Ok(path) => match FileStore::open(&path) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::warn!(error = %e, path = %path, "file store unavailable, using memory store");
                Arc::new(MemoryStore::new())
            }
        },
        Err(_) => Arc::new(MemoryStore::new()),
    };

    let mut session = match SessionContext::new(config, store) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(2);
        }
    };
    if let Err(e) = session.restore_analytics() {
        tracing::warn!(error = %e, "failed to restore intervention analytics");
    }
    let mut events = session.subscribe();
    session.start_recalibration();
    tracing::info!(session_id = %session.session_id(), "replay started");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut drain_tick = tokio::time::interval(CLOUD_DRAIN_INTERVAL);
    drain_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break;
            }
            _ = drain_tick.tick() => {}
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match serde_json::from_str::<FrameRecord>(&line) {
                        Ok(record) => process_record(&mut session, record),
                        Err(e) => tracing::warn!(error = %e, "skipping malformed input line"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to read stdin");
                        break;
                    }
                }
            }
        }

        session.drain_cloud_predictions();
        if let Err(e) = flush_events(&mut events, &mut stdout).await {
            tracing::error!(error = %e, "failed to write events");
            break;
        }
    }

    session.stop_recalibration();
    if let Err(e) = session.persist_analytics() {
        tracing::warn!(error = %e, "failed to persist intervention analytics");
    }
    let _ = flush_events(&mut events, &mut stdout).await;

    match serde_json::to_string(&session.snapshot()) {
        Ok(summary) => tracing::info!(%summary, "replay finished"),
        Err(e) => tracing::warn!(error = %e, "failed to serialize session snapshot"),
    }
}

fn process_record(session: &mut SessionContext, record: FrameRecord) {
    let now_ms = record.timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

    if record.prediction.is_some() || record.visibility.is_some() {
        let image = match record.image.as_deref().map(|raw| STANDARD.decode(raw)) {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "ignoring undecodable frame image");
                Vec::new()
            }
            None => Vec::new(),
        };
        session.observe_frame_at(
            CapturedFrame {
                image,
                prediction: record.prediction,
                visibility: record.visibility,
            },
            now_ms,
        );
    }

    if let Some(response) = record.response {
        session.record_intervention_response_at(response.tier, response.accepted, now_ms);
    }

    if record.evaluate {
        session.evaluate_intervention_at(now_ms);
    }
}

async fn flush_events(
    events: &mut broadcast::Receiver<EventEnvelope>,
    stdout: &mut tokio::io::Stdout,
) -> std::io::Result<()> {
    loop {
        match events.try_recv() {
            Ok(envelope) => {
                let mut line = serde_json::to_vec(&envelope)?;
                line.push(b'\n');
                stdout.write_all(&line).await?;
            }
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event output lagged");
            }
            Err(_) => break,
        }
    }
    stdout.flush().await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
