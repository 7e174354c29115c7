//! Advertises an `/add_two_ints` service and calls it once from a second
//! node, then keeps serving until Ctrl+C.

use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roslink::{
    builder::NodeBuilder,
    msg::{FieldSpec, FieldType, MessageSchema, MessageType, Value},
    tcpros::service::ServiceType,
    Node,
};

fn two_ints() -> ServiceType {
    let request = MessageType::dynamic(
        "demo_msgs/TwoIntsReq",
        "int64 a\nint64 b\n",
        MessageSchema::new(vec![
            FieldSpec::scalar("a", FieldType::I64),
            FieldSpec::scalar("b", FieldType::I64),
        ]),
    );

    let response = MessageType::dynamic(
        "demo_msgs/TwoIntsRes",
        "int64 sum\n",
        MessageSchema::new(vec![FieldSpec::scalar("sum", FieldType::I64)]),
    );

    ServiceType::dynamic("demo_msgs/TwoInts", request, response)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("add_two_ints=info".parse()?),
        )
        .without_time()
        .init();

    let node = Node::new("/add_two_ints_server", std::env::args().skip(1)).await?;

    let srv_type = two_ints();
    let response_type = srv_type.response().clone();

    let _server = node
        .advertise_service("/add_two_ints", &srv_type, move |req| {
            let response_type = response_type.clone();

            async move {
                let a = req.get("a").and_then(Value::as_i64).unwrap_or(0);
                let b = req.get("b").and_then(Value::as_i64).unwrap_or(0);

                info!("Handling sum request: {a} + {b} = {}", a + b);

                let mut response = response_type.new_message();
                response
                    .set("sum", Value::I64(a + b))
                    .map_err(|e| e.to_string())?;

                Ok(response)
            }
        })
        .await?;

    // Exercise the service once from a second node.
    let caller = NodeBuilder::new()
        .name("/add_two_ints_caller")
        .master_url(node.master_url().as_str())
        .build()
        .await?;

    let client = caller.service_client("/add_two_ints", &srv_type, false)?;

    let mut request = srv_type.request().new_message();
    request.set("a", Value::I64(19))?;
    request.set("b", Value::I64(23))?;

    let response = client.call(request).await?;
    info!("19 + 23 = {:?}", response.get("sum"));

    caller.shutdown_and_wait(None).await?;

    info!("Serving /add_two_ints, press Ctrl+C to exit.");
    signal::ctrl_c().await?;

    node.shutdown_and_wait(None).await?;

    Ok(())
}
