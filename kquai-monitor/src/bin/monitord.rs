//! kQuai monitor daemon.
//!
//! Polls the configured node, logs every window update and optionally serves
//! the latest report over HTTP. SIGHUP forces a full refresh; SIGINT and
//! SIGTERM shut down.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use kquai_monitor::api::{self, AppState};
use kquai_monitor::config::Config;
use kquai_monitor::node::NodeClient;
use kquai_monitor::poller::{PollCommand, PollController, PollEvent};
use kquai_monitor::report::Report;
use kquai_monitor::rpc::RpcClient;
use kquai_monitor::tracing::{self, prelude::*};
use kquai_monitor::units::{format_wei, quote_decimals, QITS_PER_QI};

fn config_path() -> Option<PathBuf> {
    let args: Vec<String> = env::args().collect();
    args.iter()
        .position(|arg| arg == "--config" || arg == "-c")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
}

fn log_report(report: &Report) {
    let Some(latest) = &report.latest else {
        return;
    };
    info!(
        block = latest.block_number,
        ratio = %format!("{:.6}", latest.ratio),
        delta_k_pct = %format!("{:.4}", latest.delta_k.mul_int(100)),
        stance = %report.stance,
        entries = report.entries,
        lost = report.lost_entries,
        chunks = report.chunks.len(),
        timestamp = ?latest.timestamp(),
        "Window updated"
    );
    if report.degraded {
        warn!(lost = report.lost_entries, "Window holds blocks lost to failed batch slices");
    }
    debug!(stance = %report.stance, "{}", report.stance.summary());
}

async fn log_quote(node: &NodeClient) {
    match node.qi_to_quai(QITS_PER_QI).await {
        Ok(Some(wei)) => info!(quai = %format_wei(wei, quote_decimals(wei)), "1 Qi quote"),
        Ok(None) => debug!("Node has no Qi to Quai rate"),
        Err(e) => warn!(error = %e, "Qi to Quai quote failed"),
    }
}

/// Publish controller events to the API state and the log until `running`
/// is cancelled or the controller goes away.
async fn consume_events(
    mut events: mpsc::Receiver<PollEvent>,
    node: Arc<NodeClient>,
    state: AppState,
    running: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = running.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        state.record(&event).await;
        match &event {
            PollEvent::Updated(report) => {
                log_report(report);
                tokio::select! {
                    _ = running.cancelled() => break,
                    _ = log_quote(&node) => {}
                }
            }
            PollEvent::Unchanged => trace!("No new blocks."),
            PollEvent::Failed { message } => error!(error = %message, "Refresh failed"),
        }
    }
    trace!("Event consumer stopped.");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load(config_path().as_deref());
    tracing::init_journald_or_stdout(
        config.as_ref().ok().and_then(|c| c.log.level.as_deref()),
    );
    let config = config.context("loading configuration")?;

    info!(
        url = %config.rpc.url,
        window = config.window.size,
        chunk_size = config.window.chunk_size,
        "Starting."
    );

    let client = RpcClient::new(config.rpc.url.clone(), config.call_options());
    let node = Arc::new(NodeClient::new(client, config.rpc.max_items_per_post));
    let controller = PollController::new(node.clone(), config.engine(), config.window_settings());
    let state = AppState::new();

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();

    let (command_tx, command_rx) = mpsc::channel(8);
    let (event_tx, event_rx) = mpsc::channel(8);
    tracker.spawn(controller.run(
        command_rx,
        event_tx,
        config.poll_interval(),
        config.window.auto_poll,
        running.clone(),
    ));
    tracker.spawn(consume_events(event_rx, node, state.clone(), running.clone()));

    if let Some(listen) = config.api.listen {
        let running = running.clone();
        tracker.spawn(async move {
            if let Err(e) = api::serve(listen, state, running).await {
                error!(error = %e, "API server failed");
            }
        });
    }
    tracker.close();
    info!("Started.");

    let mut sigint = unix::signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm =
        unix::signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sighup = unix::signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    loop {
        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            _ = sighup.recv() => {
                info!("Refresh requested.");
                if command_tx.send(PollCommand::Refresh).await.is_err() {
                    break;
                }
            }
        }
    }

    trace!("Shutting down.");
    running.cancel();

    tracker.wait().await;
    info!("Exiting.");
    Ok(())
}
