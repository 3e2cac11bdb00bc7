//! Standalone mode: one process, in-process cache and queue.

use std::net::SocketAddr;
use std::sync::Arc;

use heartwatch_api::{ApiState, build_router};
use heartwatch_cache::MemoryCache;
use heartwatch_core::{Clock, HeartwatchConfig, SystemClock};
use heartwatch_queue::MemoryDelayedQueue;
use heartwatch_state::StateStore;
use heartwatch_tracker::{HeartbeatTracker, ReportThrottle, TrackerEvent};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

pub async fn run(config: HeartwatchConfig) -> anyhow::Result<()> {
    info!("Heartwatch daemon starting in standalone mode");

    // Ensure data directory exists.
    std::fs::create_dir_all(&config.server.data_dir)?;
    let db_path = config.server.data_dir.join("heartwatch.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let cache = Arc::new(MemoryCache::new(clock.clone()));
    let queue = Arc::new(MemoryDelayedQueue::new(clock.clone()));

    let tracker = Arc::new(HeartbeatTracker::new(
        store.clone(),
        cache.clone(),
        queue,
        clock.clone(),
        &config,
    ));
    info!(
        default_poll_interval_ms = config.heartbeat.default_poll_interval_ms,
        jitter_factor = config.heartbeat.jitter_factor,
        timeout_grace_seconds = config.heartbeat.timeout_grace_seconds,
        "heartbeat tracker initialized"
    );

    let throttle = Arc::new(ReportThrottle::new(
        cache.clone(),
        store.clone(),
        clock.clone(),
        config.report_window(),
        config.io_timeout(),
    ));

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let consumer_handle = tokio::spawn(tracker.clone().run(shutdown_rx.clone()));

    let stats_handle = {
        let tracker = tracker.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { tracker.run_stats(shutdown).await })
    };

    let logger_handle = tokio::spawn(log_events(tracker.subscribe(), shutdown_rx.clone()));

    // Expired cache entries are otherwise only dropped on access.
    let purge_handle = {
        let cache = cache.clone();
        let mut shutdown = shutdown_rx.clone();
        let every = config.stats_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(every) => {
                        if let Err(e) = cache.purge_expired() {
                            warn!(error = %e, "cache purge failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    };

    // ── Start API server ───────────────────────────────────────

    let router = build_router(ApiState {
        store,
        tracker: tracker.clone(),
        throttle,
        clock,
    });
    let addr: SocketAddr = config.server.listen.parse()?;

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    tracker.close().await;

    // Wait for background tasks.
    let _ = consumer_handle.await;
    let _ = stats_handle.await;
    let _ = logger_handle.await;
    let _ = purge_handle.await;

    info!("Heartwatch daemon stopped");
    Ok(())
}

/// Log every change and stats event until shutdown.
async fn log_events(
    mut events: mpsc::UnboundedReceiver<TrackerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(TrackerEvent::Change(change)) => info!(
                    device_id = %change.device_id,
                    old = %change.old_state,
                    new = %change.new_state,
                    changed_at = change.changed_at,
                    "heartbeat state change"
                ),
                Some(TrackerEvent::Stats(stats)) => info!(
                    scheduled = stats.scheduled,
                    fired = stats.fired,
                    skipped = stats.skipped,
                    stale = stats.stale,
                    persisted = stats.persisted,
                    rejected = stats.rejected,
                    window_ms = stats.window_ms,
                    "heartbeat stats"
                ),
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}
