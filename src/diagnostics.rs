//! Periodic dump of the live stream registry

use crate::stream::{live_count, live_streams, StreamInfo};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Format one registry line
fn describe(info: &StreamInfo) -> String {
    match info.peer {
        Some(peer) => format!("#{} refs={} peer={}", info.id, info.refs, peer),
        None => format!("#{} refs={}", info.id, info.refs),
    }
}

/// Log the registry once
pub fn report() {
    let count = live_count();
    info!("Live streams: {}", count);
    if count > 0 {
        for stream in live_streams() {
            debug!("  {}", describe(&stream));
        }
    }
}

/// Start the diagnostics task
///
/// Reports every `interval` until a shutdown signal arrives. A zero interval
/// disables the task and returns `None`.
pub fn spawn(
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        debug!("Diagnostics disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => report(),
                _ = shutdown_rx.recv() => break,
            }
        }
        debug!("Diagnostics stopped");
    }))
}
