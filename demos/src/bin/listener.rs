//! A ROS1 node that prints everything published on `/chatter`.
//!
//! Run `talker` (or `rostopic pub /chatter std_msgs/String hello`) next to
//! it.

use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roslink::{
    msg::{FieldSpec, FieldType, MessageSchema, MessageType},
    tcpros::subscription::MessageCallback,
    Node,
};

fn string_type() -> MessageType {
    MessageType::with_md5(
        "std_msgs/String",
        "string data\n",
        "992ce8a1687cec8c8bd883ec73ca41d1",
        MessageSchema::new(vec![FieldSpec::scalar("data", FieldType::String)]),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("listener=info".parse()?))
        .without_time()
        .init();

    let node = Node::new("/listener", std::env::args().skip(1)).await?;

    let _subscriber = node
        .subscribe(
            "/chatter",
            &string_type(),
            false,
            MessageCallback::message_with_event(|msg, event| {
                info!(
                    "[{}] {:?}",
                    event.publisher_name,
                    msg.get("data").and_then(|v| v.as_str()).unwrap_or("")
                );
            }),
        )
        .await?;

    info!("Listening on /chatter, press Ctrl+C to exit.");

    tokio::select! {
        _ = node.spin() => {}
        _ = signal::ctrl_c() => {
            info!("Ctrl+C detected, exiting");
        }
    }

    node.shutdown_and_wait(None).await?;

    Ok(())
}
