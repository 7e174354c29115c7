use std::{
    future::Future,
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};

use ros_core_rs::core::Master;
use tokio::net::TcpListener;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use roslink::{builder::NodeBuilder, Node, NodeError};

pub mod msg;

#[allow(dead_code)]
pub mod action;

/// Spin up a ROS master on an ephemeral loopback port and connect a fresh
/// node to it.
pub async fn setup() -> (Node, WorkerGuard) {
    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(non_blocking)
        .finish();

    // Another test in this process may already have installed one.
    let _ = tracing::subscriber::set_global_default(subscriber);

    let master_addr = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap()
        .local_addr()
        .unwrap();

    let ros_master = Master::new(&master_addr);

    tokio::spawn(async move {
        ros_master.serve().await.unwrap();
    });

    let node = NodeBuilder::new()
        .advertise_hostname(Ipv4Addr::LOCALHOST.to_string())
        .master_url(format!("http://{}:{}", master_addr.ip(), master_addr.port()))
        .build()
        .await
        .unwrap();

    (node, guard)
}

/// Build a second node against the same master.
#[allow(dead_code)]
pub async fn sibling_node(node: &Node, name: &str) -> Node {
    NodeBuilder::new()
        .name(name)
        .advertise_hostname(Ipv4Addr::LOCALHOST.to_string())
        .master_url(node.master_url().as_str())
        .build()
        .await
        .unwrap()
}

/// Drive a node's callback loop for the remainder of the test.
#[allow(dead_code)]
pub fn spin_in_background(node: &Node) {
    let node = node.clone();
    tokio::spawn(async move { node.spin().await });
}

#[allow(dead_code)]
pub async fn wait_until<F, T, Fut>(mut condition: F) -> Result<T, NodeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, NodeError>>,
{
    let mut interval = tokio::time::interval(Duration::from_millis(100));

    loop {
        if let Some(val) = condition().await? {
            return Ok(val);
        }

        interval.tick().await;
    }
}

#[allow(dead_code)]
pub async fn wait_for_subscriber_connections(
    node: &Node,
    topic_name: &str,
    subscriber_count: usize,
    timeout: Duration,
) {
    tokio::time::timeout(
        timeout,
        wait_until(|| async {
            if let Some(connected_subscribers) =
                node.get_connected_subscriber_ids(topic_name).await?
            {
                if connected_subscribers.len() == subscriber_count {
                    return Ok(Some(connected_subscribers));
                }
            }

            Ok(None)
        }),
    )
    .await
    .unwrap_or_else(|_| {
        panic!("Timed out waiting for {subscriber_count} subscriber(s) to connect")
    })
    .unwrap();
}

#[allow(dead_code)]
pub async fn wait_for_publisher_connections(
    node: &Node,
    topic_name: &str,
    publisher_count: usize,
    timeout: Duration,
) {
    tokio::time::timeout(
        timeout,
        wait_until(|| async {
            if let Some(connected_publishers) =
                node.get_connected_publisher_uris(topic_name).await?
            {
                if connected_publishers.len() == publisher_count {
                    return Ok(Some(connected_publishers));
                }
            }

            Ok(None)
        }),
    )
    .await
    .unwrap_or_else(|_| {
        panic!("Timed out waiting for {publisher_count} publisher(s) to connect")
    })
    .unwrap();
}
