use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;

use super::{broker_settings, eventually, node_settings, start_broker};
use crate::broker::Broker;
use crate::broker::topic::{DUPLICATE_PUBLISHER, TYPE_MISMATCH};
use crate::message::{Message, TestMessage};
use crate::node::Node;
use crate::transport::message::{Confirmation, RpcRequest, RpcResponse, ServingStatus};
use crate::transport::rpc_client::RpcClient;
use crate::transport::rpc_server::{RpcHandler, RpcServer};

/// Stands in for a subscriber node: counts `inform_of_publisher` calls and
/// refuses the first `refusals` of them.
struct FakeNode {
    informed: AtomicUsize,
    refusals: usize,
}

impl RpcHandler for FakeNode {
    async fn handle(&self, request: RpcRequest) -> RpcResponse {
        match request {
            RpcRequest::InformOfPublisher { .. } => {
                let call = self.informed.fetch_add(1, Ordering::SeqCst);
                if call < self.refusals {
                    RpcResponse::Confirmation(Confirmation::rejected(1, "not yet"))
                } else {
                    RpcResponse::Confirmation(Confirmation::ok("bound"))
                }
            }
            _ => RpcResponse::Confirmation(Confirmation::ok("ok")),
        }
    }
}

async fn fake_subscriber(
    broker: &RpcClient,
    name: &str,
    topic: &str,
    refusals: usize,
) -> (Arc<FakeNode>, RpcServer) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let handler = Arc::new(FakeNode {
        informed: AtomicUsize::new(0),
        refusals,
    });
    let server = RpcServer::start(listener, handler.clone()).unwrap();
    let port = server.local_addr().port();

    assert!(
        broker
            .register_client(name, "127.0.0.1", port, port)
            .await
            .unwrap()
            .is_ok()
    );
    let (confirmation, publishers) = broker
        .subscribe_topic(name, topic, TestMessage::TYPE_NAME)
        .await
        .unwrap();
    assert!(confirmation.is_ok());
    assert!(publishers.is_empty());
    (handler, server)
}

fn client_for(broker: &Broker) -> RpcClient {
    RpcClient::new(broker.local_addr().to_string(), Duration::from_secs(2))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_broker_health_and_registration() {
    let broker = start_broker().await;
    let client = client_for(&broker);

    assert_eq!(client.health_check().await.unwrap(), ServingStatus::Serving);
    assert!(client.register_client("a", "127.0.0.1", 1, 2).await.unwrap().is_ok());
    assert_eq!(
        client.register_client("a", "127.0.0.1", 3, 4).await.unwrap().code,
        1
    );

    let info = client.get_client_info("a").await.unwrap().unwrap();
    assert_eq!(info.control_port, 1);
    assert!(info.registered_at > 0);
    assert!(client.get_client_info("b").await.unwrap().is_none());
    assert_eq!(client.get_registered_clients().await.unwrap().len(), 1);

    assert_eq!(client.deregister_client("b").await.unwrap().code, 1);
    assert!(client.deregister_client("a").await.unwrap().is_ok());
    assert!(broker.registered_clients().is_empty());

    broker.shutdown(false).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_and_mismatched_advertise() {
    let broker = start_broker().await;
    let client = client_for(&broker);

    let first = client
        .advertise_topic("pub", "127.0.0.1", 1, "/test", "TestMessage")
        .await
        .unwrap();
    assert!(first.is_ok());
    let again = client
        .advertise_topic("pub", "127.0.0.1", 1, "/test", "TestMessage")
        .await
        .unwrap();
    assert_eq!(again.code, DUPLICATE_PUBLISHER);
    let mismatched = client
        .advertise_topic("other", "127.0.0.1", 2, "/test", "StringMessage")
        .await
        .unwrap();
    assert_eq!(mismatched.code, TYPE_MISMATCH);

    let topic = broker.topic_snapshot("/test").unwrap();
    assert_eq!(topic.publishers.len(), 1);
    assert_eq!(topic.message_type, "TestMessage");

    let topics = client.list_topics().await.unwrap();
    assert_eq!(topics.len(), 1);
    assert_eq!(topics[0].name, "/test");

    broker.shutdown(false).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_late_publisher_is_announced_exactly_once() {
    let broker = start_broker().await;
    let client = client_for(&broker);
    let (fake, server) = fake_subscriber(&client, "sub", "/test", 0).await;

    client
        .advertise_topic("pub", "127.0.0.1", 1, "/test", "TestMessage")
        .await
        .unwrap();
    assert!(eventually(|| fake.informed.load(Ordering::SeqCst) == 1).await);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fake.informed.load(Ordering::SeqCst), 1);
    assert!(broker.services().announcements().is_empty());

    server.shutdown().await;
    broker.shutdown(false).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_refused_announcement_is_retried() {
    let broker = start_broker().await;
    let client = client_for(&broker);
    let (fake, server) = fake_subscriber(&client, "sub", "/test", 2).await;

    client
        .advertise_topic("pub", "127.0.0.1", 1, "/test", "TestMessage")
        .await
        .unwrap();
    assert!(eventually(|| fake.informed.load(Ordering::SeqCst) == 3).await);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fake.informed.load(Ordering::SeqCst), 3);

    server.shutdown().await;
    broker.shutdown(false).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_announcement_dead_letters_after_max_attempts() {
    let mut settings = broker_settings();
    settings.announce_max_attempts = 3;
    let broker = Broker::bind(settings).await.unwrap();
    let client = client_for(&broker);
    let (fake, server) = fake_subscriber(&client, "sub", "/test", usize::MAX).await;

    client
        .advertise_topic("pub", "127.0.0.1", 1, "/test", "TestMessage")
        .await
        .unwrap();
    assert!(eventually(|| fake.informed.load(Ordering::SeqCst) == 3).await);
    assert!(eventually(|| broker.services().announcements().is_empty()).await);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fake.informed.load(Ordering::SeqCst), 3);

    server.shutdown().await;
    broker.shutdown(false).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deregistration_cascades_into_topics() {
    let broker = start_broker().await;
    let settings = node_settings(broker.local_addr());

    let a = Node::new("node_a", settings.clone());
    let b = Node::new("node_b", settings);
    a.start().await.unwrap();
    b.start().await.unwrap();

    let _publisher = a.advertise::<TestMessage>("/shared").await.unwrap();
    let _only_a = a.advertise::<TestMessage>("/only_a").await.unwrap();
    b.subscribe::<TestMessage, _>("/shared", |_| {}).await.unwrap();

    a.shutdown(false).await;
    assert!(broker.topic_snapshot("/only_a").is_none());
    let shared = broker.topic_snapshot("/shared").unwrap();
    assert!(shared.publishers.is_empty());
    assert_eq!(shared.subscribers, vec!["node_b"]);

    b.shutdown(false).await;
    assert!(broker.topic_snapshot("/shared").is_none());
    assert!(broker.registered_clients().is_empty());

    broker.shutdown(false).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_broker_shutdown_stops_nodes() {
    let broker = start_broker().await;
    let node = Node::new("follower", node_settings(broker.local_addr()));
    node.start().await.unwrap();

    broker.shutdown(true).await;
    broker.shutdown(true).await;
    assert!(!broker.is_running());

    tokio::time::timeout(Duration::from_secs(5), node.wait_for_shutdown())
        .await
        .unwrap();
    assert!(node.is_shut_down());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_node_name_fails_to_start() {
    let broker = start_broker().await;
    let settings = node_settings(broker.local_addr());
    let first = Node::new("twin", settings.clone());
    let second = Node::new("twin", settings);

    first.start().await.unwrap();
    first.start().await.unwrap();
    let err = second.start().await.unwrap_err();
    assert!(matches!(
        err,
        crate::utils::error::Error::RegistrationFailed { code: 1, .. }
    ));
    assert!(!second.is_started());

    first.shutdown(false).await;
    broker.shutdown(false).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_starts_share_a_failed_registration() {
    let broker = start_broker().await;
    let settings = node_settings(broker.local_addr());
    let holder = Node::new("taken", settings.clone());
    holder.start().await.unwrap();

    let latecomer = Node::new("taken", settings);
    let (first, second) = tokio::join!(latecomer.start(), latecomer.start());
    assert!(first.is_err());
    assert!(second.is_err());
    assert!(!latecomer.is_started());
    assert!(matches!(
        latecomer.advertise::<TestMessage>("/test").await,
        Err(crate::utils::error::Error::NotStarted)
    ));

    holder.shutdown(false).await;
    broker.shutdown(false).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_during_start_leaves_nothing_registered() {
    let broker = start_broker().await;
    let node = Node::new("racer", node_settings(broker.local_addr()));
    let stopper = node.clone();

    let _ = tokio::join!(node.start(), async {
        tokio::task::yield_now().await;
        stopper.shutdown(false).await;
    });
    tokio::time::timeout(Duration::from_secs(1), node.wait_for_shutdown())
        .await
        .unwrap();

    assert!(node.is_shut_down());
    assert!(node.control_addr().is_none());
    assert!(broker.registered_clients().is_empty());

    let again = Node::new("racer", node_settings(broker.local_addr()));
    again.start().await.unwrap();
    again.shutdown(false).await;
    broker.shutdown(false).await;
}
