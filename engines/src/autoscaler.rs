//! Background task that unloads idle engines.
//!
//! Sleeps on a computed interval, woken early by coordinator activity
//! (add/remove/get) or shutdown. Each pass delegates to
//! [`NodeManager::autoscale_pass`], which skips engines with active jobs
//! and reports when the next record is due to become idle.

use std::sync::Arc;
use std::time::Duration;

use crate::manager::NodeManager;

pub(crate) async fn run(manager: Arc<NodeManager>) {
    tracing::info!("Autoscaler task started");

    let mut next_interval = Duration::from_secs(10);
    loop {
        tokio::select! {
            _ = manager.shutdown_token().cancelled() => break,
            _ = manager.autoscaler_notified() => {},
            _ = tokio::time::sleep(next_interval) => {},
        }
        if manager.shutdown_token().is_cancelled() {
            break;
        }

        next_interval = manager.autoscale_pass();
        tracing::debug!(
            next_check_secs = next_interval.as_secs(),
            "Autoscaling pass complete"
        );
    }

    tracing::info!("Autoscaler task finished");
}
