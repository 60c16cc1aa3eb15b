//! Every tunable spec §6 names, with a `Default` matching its stated
//! defaults. Built from `clap` flags by the CLI binary rather than the
//! free-form `setup` dict `tinybt`'s `DHT.__init__`/`DHT_Router.__init__`
//! merge over defaults.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// How often the discovery loop runs a random `find_node`.
    pub discover_interval: Duration,
    /// How often the liveness-check loop re-pings stale nodes.
    pub check_interval: Duration,
    /// How many stale nodes the liveness-check loop pings per tick.
    pub check_batch: usize,
    /// Per-ping timeout used by the liveness-check loop.
    pub check_ping_timeout: Duration,
    /// A node is "stale" (due for a liveness check) after this long
    /// without a successful ping.
    pub check_staleness: Duration,
    /// Routing-table status-report cadence.
    pub report_interval: Duration,
    /// Size-limiter cadence.
    pub limit_interval: Duration,
    /// Size-limiter ceiling.
    pub limit_ceiling: usize,
    /// Blacklist-redemption cadence.
    pub redeem_interval: Duration,
    /// Fraction of the blacklist redeemed per tick.
    pub redeem_fraction: f64,
    /// Default per-round timeout for a KRPC query (`dht_ping`, and each
    /// round of the iterative search).
    pub query_timeout: Duration,
    /// Timeout for the bootstrap ping; its expiry is fatal to `Dht::new`.
    pub bootstrap_timeout: Duration,
    /// Per-endpoint retry budget for the iterative search.
    pub search_retries: u32,
    /// Client-version tag (`v`) echoed in every outgoing message.
    pub client_version: Vec<u8>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            discover_interval: Duration::from_secs(180),
            check_interval: Duration::from_secs(30),
            check_batch: 10,
            check_ping_timeout: Duration::from_secs(5),
            check_staleness: Duration::from_secs(15 * 60),
            report_interval: Duration::from_secs(10),
            limit_interval: Duration::from_secs(30),
            limit_ceiling: 2000,
            redeem_interval: Duration::from_secs(300),
            redeem_fraction: 0.05,
            query_timeout: Duration::from_secs(5),
            bootstrap_timeout: Duration::from_secs(1),
            search_retries: 2,
            client_version: b"RS01".to_vec(),
        }
    }
}

impl Config {
    pub fn maintenance_config(&self) -> routing_table::MaintenanceConfig {
        routing_table::MaintenanceConfig {
            report_interval: self.report_interval,
            limit_interval: self.limit_interval,
            limit_ceiling: self.limit_ceiling,
            redeem_interval: self.redeem_interval,
            redeem_fraction: self.redeem_fraction,
        }
    }
}
