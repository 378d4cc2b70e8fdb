//! Component G: the three periodic sweeper tasks (§4.G), started alongside
//! the server and torn down on shutdown via the shared [`CancellationToken`](tokio_util::sync::CancellationToken).

use std::time::Duration;

use tracing::{info, warn};

use crate::hub::MessageHub;
use crate::policy::DiversityMetrics;
use crate::protocol::OutboundEnvelope;
use crate::state::SharedState;

const HOURLY_SUMMARY: Duration = Duration::from_secs(60 * 60);

/// Spawns the idle-session sweeper, lock expirer, and metrics tick. Each
/// task exits when `state.shutdown` is cancelled.
pub fn spawn_all(state: SharedState) -> Vec<tokio::task::JoinHandle<()>> {
    vec![
        tokio::spawn(idle_session_sweeper(state.clone())),
        tokio::spawn(lock_expirer(state.clone())),
        tokio::spawn(metrics_tick(state)),
    ]
}

async fn idle_session_sweeper(state: SharedState) {
    let mut interval = tokio::time::interval(Duration::from_secs(state.config.idle_sweep_interval_secs));
    let mut since_last_summary = Duration::ZERO;
    let hub = MessageHub::new(state.clone());

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let cleaned = state.identity.cleanup_inactive(state.config.idle_timeout()).await;
        if cleaned > 0 {
            hub.broadcast(
                &OutboundEnvelope::SessionCleanup {
                    cleaned_sessions: cleaned,
                    timestamp: chrono::Utc::now(),
                },
                None,
            )
            .await;
        }

        since_last_summary += Duration::from_secs(state.config.idle_sweep_interval_secs);
        if since_last_summary >= HOURLY_SUMMARY {
            since_last_summary = Duration::ZERO;
            let total = state.identity.total_count().await;
            let active = state.identity.connected_count().await;
            info!(
                active,
                inactive = total.saturating_sub(active),
                total,
                "hourly identity summary"
            );
        }
    }
}

async fn lock_expirer(state: SharedState) {
    let mut interval = tokio::time::interval(Duration::from_secs(state.config.lock_sweep_interval_secs));
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        state.locks.sweep_expired().await;
    }
}

async fn metrics_tick(state: SharedState) {
    let mut interval = tokio::time::interval(Duration::from_secs(state.config.metrics_interval_secs));
    let hub = MessageHub::new(state.clone());

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        if !state.anti_echo.enabled() {
            continue;
        }

        let metrics: DiversityMetrics = state.anti_echo.metrics_snapshot().await;

        if metrics.agreement_rate > 0.8 {
            warn!(agreement_rate = metrics.agreement_rate, "agreement rate above threshold; echo chamber risk");
        }
        if metrics.overall_diversity < 0.5 {
            warn!(diversity = metrics.overall_diversity, "overall diversity below threshold");
        }

        hub.broadcast(
            &OutboundEnvelope::DiversityMetrics {
                overall_diversity: metrics.overall_diversity,
                agreement_rate: metrics.agreement_rate,
                evidence_rate: metrics.evidence_rate,
                perspective_distribution: metrics.perspective_distribution,
                recent_interventions: metrics.recent_interventions,
            },
            None,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::state::AppState;

    #[tokio::test]
    async fn idle_sweeper_survives_a_tick_with_nothing_to_clean() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::default();
        config.workspace_dir = dir.path().to_path_buf();
        config.idle_sweep_interval_secs = 1;
        let state = AppState::init(config).await.unwrap();

        let cleaned = state.identity.cleanup_inactive(state.config.idle_timeout()).await;
        assert_eq!(cleaned, 0);
    }

    #[tokio::test]
    async fn spawned_sweepers_stop_on_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::default();
        config.workspace_dir = dir.path().to_path_buf();
        config.idle_sweep_interval_secs = 60;
        config.lock_sweep_interval_secs = 60;
        config.metrics_interval_secs = 60;
        let state = AppState::init(config).await.unwrap();

        let handles = spawn_all(state.clone());
        state.shutdown.cancel();

        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .expect("sweeper task did not observe cancellation in time")
                .unwrap();
        }
    }
}
