//! Idle connection reaper
//!
//! Background task that periodically closes pooled connections that have been
//! idle longer than the connection threshold and expires sessions idle longer
//! than the (larger) session threshold. Expiring a session closes every
//! connection opened under it.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::ConnectionPool;

/// Run the reaper until `cancel` fires.
///
/// # Arguments
///
/// * `pool` - The pool to sweep
/// * `cancel` - Cancellation token for graceful shutdown
pub async fn run_reaper(pool: Arc<ConnectionPool>, cancel: CancellationToken) {
    let config = pool.config().clone();
    let mut interval = tokio::time::interval(config.reap_interval);

    tracing::info!(
        "Starting connection reaper (connection idle: {:?}, session idle: {:?}, interval: {:?})",
        config.connection_idle_timeout,
        config.session_idle_timeout,
        config.reap_interval
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let summary = pool.reap().await;
                if summary.sessions_expired > 0 || summary.connections_closed > 0 {
                    tracing::info!(
                        "Reaper expired {} session(s) and closed {} connection(s)",
                        summary.sessions_expired,
                        summary.connections_closed
                    );
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Connection reaper shutting down");
                break;
            }
        }
    }
}

/// Spawn [`run_reaper`] on the current runtime
pub fn spawn_reaper(
    pool: Arc<ConnectionPool>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run_reaper(pool, cancel))
}
