use anyhow::{Context, Result};
use fleet_dispatch::actuation::ChannelActuator;
use fleet_dispatch::config::{default_config, load_config};
use fleet_dispatch::decision_log::open_sink;
use fleet_dispatch::dispatch::{DispatchLoop, IngestOutcome, ShutdownHandle, TelemetryIngestor};
use fleet_dispatch::provider::NullProvider;
use fleet_dispatch::telemetry::TelemetryMessage;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber (stdout carries commands, logs go to stderr)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleet_dispatch=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Fleet dispatch starting...");

    let config = match std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FLEET_CONFIG").ok())
    {
        Some(path) => {
            info!(path = %path, "Loading configuration");
            load_config(&path)?
        }
        None => {
            info!("No config file given, using defaults");
            default_config()?
        }
    };

    let decision_log = open_sink(&config.decision_log).context("Failed to open decision log")?;
    let (actuator, mut commands_rx) = ChannelActuator::new(config.dispatch.telemetry_buffer);

    // No provider wired in this binary: every cycle runs on the fallback policy
    let (dispatch_loop, ingestor) = DispatchLoop::new(
        &config,
        Arc::new(NullProvider),
        Arc::new(actuator),
        Arc::from(decision_log),
    );
    let shutdown = dispatch_loop.shutdown_handle();
    let metrics = dispatch_loop.metrics();

    // Validated commands -> stdout, one JSON object per line
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(command) = commands_rx.recv().await {
            let mut line = serde_json::to_string(&command)?;
            line.push('\n');
            stdout.write_all(line.as_bytes()).await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    let reader = tokio::spawn(read_telemetry(ingestor, shutdown.clone()));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, shutting down");
                shutdown.shutdown();
            }
        });
    }

    let result = dispatch_loop.run().await;

    reader.abort();
    match writer.await {
        Ok(Err(e)) => error!(error = %e, "Command writer failed"),
        Err(e) => error!(error = %e, "Command writer task panicked"),
        Ok(Ok(())) => {}
    }

    info!(metrics = ?metrics.snapshot(), "Fleet dispatch stopped");
    result
}

/// Feed JSON-lines telemetry from stdin; EOF requests shutdown
async fn read_telemetry(ingestor: TelemetryIngestor, shutdown: ShutdownHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Failed to read telemetry from stdin");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message: TelemetryMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Malformed telemetry line skipped");
                continue;
            }
        };

        match ingestor.ingest_message(message).await {
            Ok(IngestOutcome::Forwarded) => {}
            Ok(outcome) => debug!(outcome = ?outcome, "Telemetry not forwarded"),
            Err(e) => warn!(error = %e, "Telemetry rejected"),
        }
    }

    info!("Telemetry input closed, shutting down");
    shutdown.shutdown();
}
