// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Thermis host — JSON-lines command host for the receipt print dispatcher.
//
// Reads one command object per stdin line and writes one response object per
// stdout line.  Commands run concurrently; a response echoes the request's
// `id` when one was given.  Discovery events are written as they arrive.
// Logs go to stderr.  EOF on stdin shuts the dispatcher down.

mod services;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use thermis_dispatch::{Command, CommandSurface, Dispatcher};

use services::HostOptions;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
/// JSON-lines command host for the Thermis receipt print dispatcher
struct Cli {
    /// Dispatch config file (JSON); defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Duration of every simulated printer operation, in milliseconds
    #[arg(long, default_value = "250")]
    simulate_latency_ms: u64,
    /// Gate LAN jobs on a real TCP connect to the printer
    #[arg(long)]
    probe_lan: bool,
    /// Browse mDNS for printers when discovery is requested
    #[arg(long)]
    mdns: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    info!("Thermis host starting");

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "host failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> thermis_core::error::Result<()> {
    let config = services::load_config(cli.config.as_deref())?;
    let options = HostOptions {
        latency: Duration::from_millis(cli.simulate_latency_ms),
        probe_lan: cli.probe_lan,
        mdns: cli.mdns,
    };
    let backends = services::build_backends(options, &config);
    let dispatcher = Arc::new(Dispatcher::new(config, backends)?);

    let (out_tx, out_rx) = mpsc::channel::<Value>(64);
    let writer = tokio::spawn(write_lines(out_rx));

    let (events_tx, mut events_rx) = mpsc::channel(32);
    let events_out = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let line = serde_json::to_value(&event)
                .unwrap_or_else(|e| json!({ "error": format!("unserializable event: {e}") }));
            if events_out.send(line).await.is_err() {
                break;
            }
        }
    });

    let surface = Arc::new(CommandSurface::new(Arc::clone(&dispatcher)).with_discovery_sink(events_tx));

    let mut commands = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: Value = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "unparseable command line");
                let _ = out_tx.send(json!({ "error": format!("invalid JSON: {e}") })).await;
                continue;
            }
        };

        let surface = Arc::clone(&surface);
        let out = out_tx.clone();
        commands.spawn(async move {
            let id = request.get("id").cloned();
            let result = surface.handle_json(request).await;
            let reply = match id {
                Some(id) => json!({ "id": id, "result": result }),
                None => json!({ "result": result }),
            };
            let _ = out.send(reply).await;
        });
    }

    info!("stdin closed, shutting down");
    surface.handle(Command::StopDiscovery).await;
    dispatcher.shutdown().await;
    while let Some(joined) = commands.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "command task failed");
        }
    }

    drop(surface);
    drop(out_tx);
    if let Err(e) = forwarder.await {
        warn!(error = %e, "discovery forwarder failed");
    }
    if let Err(e) = writer.await {
        warn!(error = %e, "output writer failed");
    }
    info!("Thermis host stopped");
    Ok(())
}

/// Write each value as one line on stdout.
async fn write_lines(mut rx: mpsc::Receiver<Value>) {
    let mut stdout = tokio::io::stdout();
    while let Some(value) = rx.recv().await {
        let mut line = value.to_string();
        line.push('\n');
        if let Err(e) = stdout.write_all(line.as_bytes()).await {
            error!(error = %e, "stdout closed");
            break;
        }
        if let Err(e) = stdout.flush().await {
            debug!(error = %e, "stdout flush failed");
        }
    }
}
