use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the broker process, for every node and for logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub node: NodeSettings,
    pub log: LogSettings,
}

/// Configuration settings for the broker.
///
/// `host`/`port` are both where the broker binds and where nodes reach it.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    /// Tick rate of the announcement delivery loop.
    pub announce_rate_hz: u32,
    /// Delivery attempts per announcement before it is dropped.
    pub announce_max_attempts: u32,
    pub announce_backoff_ms: u64,
    pub announce_backoff_max_ms: u64,
    /// Timeout for each best-effort `InformOfShutdown` on broker shutdown.
    pub shutdown_notify_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
}

/// Configuration settings for a node.
#[derive(Debug, Deserialize, Clone)]
pub struct NodeSettings {
    /// Address the node binds and advertises to peers.
    pub host: String,
    /// First port probed for the control and data sockets; `0` means
    /// operating-system assigned.
    pub start_port: u16,
    pub rpc_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub send_timeout_ms: u64,
    /// Consecutive send failures tolerated before a subscriber is evicted.
    pub send_failure_threshold: u32,
    pub reaper_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled
/// from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub node: Option<PartialNodeSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub announce_rate_hz: Option<u32>,
    pub announce_max_attempts: Option<u32>,
    pub announce_backoff_ms: Option<u64>,
    pub announce_backoff_max_ms: Option<u64>,
    pub shutdown_notify_timeout_ms: Option<u64>,
    pub rpc_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialNodeSettings {
    pub host: Option<String>,
    pub start_port: Option<u16>,
    pub rpc_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub send_timeout_ms: Option<u64>,
    pub send_failure_threshold: Option<u32>,
    pub reaper_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings::default(),
            node: NodeSettings::default(),
            log: LogSettings {
                level: "INFO".to_string(),
            },
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 50051,
            announce_rate_hz: 60,
            announce_max_attempts: 8,
            announce_backoff_ms: 50,
            announce_backoff_max_ms: 5000,
            shutdown_notify_timeout_ms: 500,
            rpc_timeout_ms: 2000,
        }
    }
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            start_port: 50052,
            rpc_timeout_ms: 2000,
            handshake_timeout_ms: 1000,
            send_timeout_ms: 500,
            send_failure_threshold: 3,
            reaper_interval_ms: 10,
        }
    }
}

impl BrokerSettings {
    /// `host:port` as dialled by nodes.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tick(&self) -> Duration {
        period_for_rate(f64::from(self.announce_rate_hz.max(1)))
    }
}

/// Shortest period handed to a ticker; a zero period would panic.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Interval between ticks at `rate_hz`, clamped to `[MIN_PERIOD, 1000 s]`.
/// Non-positive or NaN rates use the slowest period.
pub fn period_for_rate(rate_hz: f64) -> Duration {
    Duration::from_secs_f64(1.0 / rate_hz.max(0.001)).max(MIN_PERIOD)
}

impl PartialSettings {
    /// Merges the partial values over `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let broker = match self.broker {
            Some(b) => BrokerSettings {
                host: b.host.unwrap_or(default.broker.host),
                port: b.port.unwrap_or(default.broker.port),
                announce_rate_hz: b
                    .announce_rate_hz
                    .unwrap_or(default.broker.announce_rate_hz),
                announce_max_attempts: b
                    .announce_max_attempts
                    .unwrap_or(default.broker.announce_max_attempts),
                announce_backoff_ms: b
                    .announce_backoff_ms
                    .unwrap_or(default.broker.announce_backoff_ms),
                announce_backoff_max_ms: b
                    .announce_backoff_max_ms
                    .unwrap_or(default.broker.announce_backoff_max_ms),
                shutdown_notify_timeout_ms: b
                    .shutdown_notify_timeout_ms
                    .unwrap_or(default.broker.shutdown_notify_timeout_ms),
                rpc_timeout_ms: b.rpc_timeout_ms.unwrap_or(default.broker.rpc_timeout_ms),
            },
            None => default.broker,
        };
        let node = match self.node {
            Some(n) => NodeSettings {
                host: n.host.unwrap_or(default.node.host),
                start_port: n.start_port.unwrap_or(default.node.start_port),
                rpc_timeout_ms: n.rpc_timeout_ms.unwrap_or(default.node.rpc_timeout_ms),
                handshake_timeout_ms: n
                    .handshake_timeout_ms
                    .unwrap_or(default.node.handshake_timeout_ms),
                send_timeout_ms: n.send_timeout_ms.unwrap_or(default.node.send_timeout_ms),
                send_failure_threshold: n
                    .send_failure_threshold
                    .unwrap_or(default.node.send_failure_threshold),
                reaper_interval_ms: n
                    .reaper_interval_ms
                    .unwrap_or(default.node.reaper_interval_ms),
            },
            None => default.node,
        };
        let log = LogSettings {
            level: self
                .log
                .and_then(|l| l.level)
                .unwrap_or(default.log.level),
        };
        Settings { broker, node, log }
    }
}
