use super::logging;
use super::net::{bind_available, get_available_port, resolve};

#[test]
fn logging_init_accepts_levels() {
    // Should not panic
    logging::init("INFO");
    logging::init("DEBUG");
    logging::init("WARN");
}

#[test]
fn parse_level_maps_config_strings() {
    assert_eq!(logging::parse_level("DEBUG"), tracing::Level::DEBUG);
    assert_eq!(logging::parse_level("info"), tracing::Level::INFO);
    assert_eq!(logging::parse_level("WARN"), tracing::Level::WARN);
    assert_eq!(logging::parse_level("ERR"), tracing::Level::ERROR);
    assert_eq!(logging::parse_level("FATAL"), tracing::Level::ERROR);
    assert_eq!(logging::parse_level("bogus"), tracing::Level::INFO);
}

#[test]
fn get_available_port_skips_bound_ports() {
    let taken = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let taken_port = taken.local_addr().unwrap().port();

    let port = get_available_port("127.0.0.1", taken_port).unwrap();
    assert_ne!(port, taken_port);
    assert!(port > taken_port);
}

#[test]
fn get_available_port_zero_is_ephemeral() {
    let port = get_available_port("127.0.0.1", 0).unwrap();
    assert_ne!(port, 0);
}

#[tokio::test]
async fn bind_available_returns_bound_listener() {
    let listener = bind_available("127.0.0.1", 0).await.unwrap();
    assert_ne!(listener.local_addr().unwrap().port(), 0);
}

#[tokio::test]
async fn resolve_handles_literal_addresses() {
    let addr = resolve("127.0.0.1", 4242).await.unwrap();
    assert_eq!(addr, "127.0.0.1:4242".parse().unwrap());
}
