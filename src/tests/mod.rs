//! End-to-end scenarios: a real broker and real nodes on loopback.

mod broker;

use std::net::SocketAddr;
use std::time::Duration;

use crate::broker::Broker;
use crate::config::{BrokerSettings, Settings};

pub(crate) fn broker_settings() -> BrokerSettings {
    BrokerSettings {
        host: "127.0.0.1".to_string(),
        port: 0,
        announce_rate_hz: 200,
        announce_backoff_ms: 10,
        announce_backoff_max_ms: 50,
        rpc_timeout_ms: 1000,
        ..BrokerSettings::default()
    }
}

pub(crate) async fn start_broker() -> Broker {
    Broker::bind(broker_settings()).await.unwrap()
}

pub(crate) fn node_settings(broker: SocketAddr) -> Settings {
    let mut settings = Settings::default();
    settings.broker.host = broker.ip().to_string();
    settings.broker.port = broker.port();
    settings.node.start_port = 0;
    settings
}

pub(crate) async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
