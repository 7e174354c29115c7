//! A ROS1 node that repeatedly publishes to the `/chatter` topic.
//!
//! Designed to run in tandem with `listener`, but also works with the
//! [rostopic CLI tool](http://wiki.ros.org/rostopic):
//!
//! ```bash
//! rostopic echo /chatter
//! ```

use std::time::Duration;

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use roslink::{
    msg::{FieldSpec, FieldType, MessageSchema, MessageType, Value},
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
        .with_env_filter(EnvFilter::from_default_env().add_directive("talker=info".parse()?))
        .without_time()
        .init();

    let node = Node::new("/talker", std::env::args().skip(1)).await?;

    let string_type = string_type();
    let publisher = node.advertise("/chatter", &string_type, 1, false, false).await?;

    let mut msg = string_type.new_message();
    msg.set("data", Value::String(String::from("Hello world!")))?;

    let mut interval = tokio::time::interval(Duration::from_secs(1));

    info!("Publishing to /chatter, press Ctrl+C to exit.");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = publisher.publish(&msg).await {
                    error!("Failed to publish message: {e}");
                    break;
                }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl+C detected, exiting");
                break;
            }
        }
    }

    // Clean up the registrations this node created with the ROS master.
    node.shutdown_and_wait(None).await?;

    Ok(())
}
