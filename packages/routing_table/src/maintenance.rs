//! The three periodic loops that keep a [`RoutingTable`] bounded and tidy.
//! Each runs on its own cadence and exits as soon as the cancellation token
//! fires, regardless of where in its sleep it currently is.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;

use crate::table::{always, not_in, RoutingTable};

/// Defaults from the configuration surface (see `dht_crawler::Config`).
pub struct MaintenanceConfig {
    pub report_interval: Duration,
    pub limit_interval: Duration,
    pub limit_ceiling: usize,
    pub redeem_interval: Duration,
    pub redeem_fraction: f64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        MaintenanceConfig {
            report_interval: Duration::from_secs(10),
            limit_interval: Duration::from_secs(30),
            limit_ceiling: 2000,
            redeem_interval: Duration::from_secs(300),
            redeem_fraction: 0.05,
        }
    }
}

/// Spawns the report/limit/redeem loops, returning their join handles so the
/// caller can await them after cancelling `cancel`.
pub fn spawn_all(
    table: Arc<RoutingTable>,
    config: &MaintenanceConfig,
    cancel: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    vec![
        tokio::spawn(report_loop(table.clone(), config.report_interval, cancel.clone())),
        tokio::spawn(limit_loop(
            table.clone(),
            config.limit_interval,
            config.limit_ceiling,
            cancel.clone(),
        )),
        tokio::spawn(redeem_loop(
            table,
            config.redeem_interval,
            config.redeem_fraction,
            cancel,
        )),
    ]
}

async fn wait_or_cancel(interval: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(interval) => true,
    }
}

async fn report_loop(table: Arc<RoutingTable>, interval: Duration, cancel: CancellationToken) {
    while wait_or_cancel(interval, &cancel).await {
        let stats = table.stats();
        tracing::info!(
            ids = stats.ids,
            nodes = stats.nodes,
            bad = stats.bad_endpoints,
            protected = stats.protected_ids,
            "routing table status"
        );
    }
}

#[tracing::instrument(skip(table, cancel))]
async fn limit_loop(table: Arc<RoutingTable>, interval: Duration, ceiling: usize, cancel: CancellationToken) {
    while wait_or_cancel(interval, &cancel).await {
        let Ok(all) = table.query(None, always, |_| 0u8) else {
            continue;
        };
        if all.len() <= ceiling {
            continue;
        }
        let overflow = all.len() - ceiling;
        tracing::debug!(overflow, "size limiter evicting random nodes");
        let blacklist = std::collections::HashSet::new();
        let mut candidates = table.query_allow_empty(None, not_in(&blacklist), |_| 0u8);
        let mut rng = rand::thread_rng();
        candidates.shuffle(&mut rng);
        for node in candidates.into_iter().take(overflow) {
            table.remove(&node, true);
        }
    }
}

async fn redeem_loop(table: Arc<RoutingTable>, interval: Duration, fraction: f64, cancel: CancellationToken) {
    while wait_or_cancel(interval, &cancel).await {
        let bad = table.stats().bad_endpoints;
        let count = (fraction * bad as f64) as usize;
        if count == 0 {
            continue;
        }
        tracing::debug!(count, "redeeming blacklisted endpoints");
        table.redeem_bad_endpoints(count);
    }
}
