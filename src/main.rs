//! CLI for PopMesh
//!
//! Subcommands:
//! - `server`: run the broker
//! - `publish`: publish a JSON message on a topic
//! - `subscribe`: print every message received on a topic
//! - `list-topics`, `list-clients`: query the broker

use std::time::Duration;

use clap::Parser;
use popmesh::config::{Settings, load_config, period_for_rate};
use popmesh::transport::RpcClient;
use popmesh::utils::logging;
use popmesh::{Broker, Node};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "popmesh")]
enum Command {
    /// Run the broker until interrupted
    Server,
    /// Publish a JSON-encoded message on a topic
    Publish {
        topic: String,
        /// Registered message type, e.g. `StringMessage`
        message_type: String,
        /// Message body as JSON, e.g. '{"data": "hello"}'
        data: String,
        #[arg(long, default_value_t = 1.0)]
        rate_hz: f64,
        /// Messages to send; 0 publishes until interrupted
        #[arg(long, default_value_t = 0)]
        count: u64,
    },
    /// Print messages received on a topic
    Subscribe { topic: String, message_type: String },
    /// List the topics known to the broker
    ListTopics,
    /// List the clients registered with the broker
    ListClients,
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&settings.log.level);

    let result = match cmd {
        Command::Server => run_server(settings).await,
        Command::Publish {
            topic,
            message_type,
            data,
            rate_hz,
            count,
        } => run_publish(settings, &topic, &message_type, &data, rate_hz, count).await,
        Command::Subscribe {
            topic,
            message_type,
        } => run_subscribe(settings, &topic, &message_type).await,
        Command::ListTopics => list_topics(settings).await,
        Command::ListClients => list_clients(settings).await,
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

fn broker_client(settings: &Settings) -> RpcClient {
    RpcClient::new(
        settings.broker.address(),
        Duration::from_millis(settings.node.rpc_timeout_ms),
    )
}

async fn run_server(settings: Settings) -> CliResult {
    let broker = Broker::bind(settings.broker).await?;
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Informing clients.");
    broker.shutdown(true).await;
    Ok(())
}

async fn run_publish(
    settings: Settings,
    topic: &str,
    message_type: &str,
    data: &str,
    rate_hz: f64,
    count: u64,
) -> CliResult {
    let node = Node::anonymous("publisher", settings);
    node.start().await?;

    let value: serde_json::Value = serde_json::from_str(data)?;
    let payload = node.registry().encode(message_type, &value)?;
    let publisher = node.advertise_raw(topic, message_type).await?;

    let mut ticker = tokio::time::interval(period_for_rate(rate_hz));
    let mut sent = 0u64;
    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            _ = node.wait_for_shutdown() => break Ok(()),
            _ = ticker.tick() => {}
        }
        if let Err(e) = publisher.publish_raw(message_type, &payload) {
            break Err(e);
        }
        sent += 1;
        if count > 0 && sent >= count {
            break Ok(());
        }
    };

    info!("published {sent} message(s) on {topic}");
    node.shutdown(false).await;
    Ok(result?)
}

async fn run_subscribe(settings: Settings, topic: &str, message_type: &str) -> CliResult {
    let node = Node::anonymous("subscriber", settings);
    node.start().await?;
    node.subscribe_dynamic(topic, message_type, |value| println!("{value}"))
        .await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = node.wait_for_shutdown() => info!("broker shut down"),
    }
    node.shutdown(false).await;
    Ok(())
}

async fn list_topics(settings: Settings) -> CliResult {
    for topic in broker_client(&settings).list_topics().await? {
        println!("{}\t{}", topic.name, topic.message_type);
    }
    Ok(())
}

async fn list_clients(settings: Settings) -> CliResult {
    for client in broker_client(&settings).get_registered_clients().await? {
        println!(
            "{}\t{}:{}\tdata {}",
            client.client_id, client.address, client.control_port, client.data_port
        );
    }
    Ok(())
}
