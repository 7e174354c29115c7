use std::time::Duration;

use roslink::{msg::Value, tcpros::service::client::ServiceCallError};

mod util;
use util::{
    msg::{two_ints, two_ints_request},
    setup, sibling_node,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn call_remote_service() {
    let (node, _guard) = setup().await;
    let client_node = sibling_node(&node, "/service_caller").await;

    let srv_type = two_ints();

    let response_type = srv_type.response().clone();
    let _server = node
        .advertise_service("/add_two_ints", &srv_type, move |req| {
            let response_type = response_type.clone();

            async move {
                let a = match req.get("a") {
                    Some(Value::I64(a)) => *a,
                    _ => return Err(String::from("missing field a")),
                };
                let b = match req.get("b") {
                    Some(Value::I64(b)) => *b,
                    _ => return Err(String::from("missing field b")),
                };

                let mut response = response_type.new_message();
                response
                    .set("sum", Value::I64(a + b))
                    .map_err(|e| e.to_string())?;

                Ok(response)
            }
        })
        .await
        .unwrap();

    let client = client_node
        .service_client("/add_two_ints", &srv_type, false)
        .unwrap();

    for (a, b) in [(1, 2), (-5, 5), (i64::MAX - 1, 1)] {
        let response = tokio::time::timeout(
            Duration::from_secs(5),
            client.call(two_ints_request(&srv_type, a, b)),
        )
        .await
        .expect("Service call timed out")
        .unwrap();

        assert_eq!(response.get("sum"), Some(&Value::I64(a.wrapping_add(b))));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn persistent_client_reuses_connection() {
    let (node, _guard) = setup().await;

    let srv_type = two_ints();
    let response_type = srv_type.response().clone();

    let _server = node
        .advertise_service("/add_two_ints", &srv_type, move |_req| {
            let response_type = response_type.clone();

            async move {
                let mut response = response_type.new_message();
                response.set("sum", Value::I64(42)).map_err(|e| e.to_string())?;
                Ok(response)
            }
        })
        .await
        .unwrap();

    let client = node
        .service_client("/add_two_ints", &srv_type, true)
        .unwrap();

    for _ in 0..3 {
        let response = tokio::time::timeout(
            Duration::from_secs(5),
            client.call(two_ints_request(&srv_type, 0, 0)),
        )
        .await
        .expect("Service call timed out")
        .unwrap();

        assert_eq!(response.get("sum"), Some(&Value::I64(42)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn callback_error_reaches_the_caller() {
    let (node, _guard) = setup().await;

    let srv_type = two_ints();

    let _server = node
        .advertise_service("/add_two_ints", &srv_type, |_req| async move {
            Err(String::from("arithmetic is closed today"))
        })
        .await
        .unwrap();

    let client = node
        .service_client("/add_two_ints", &srv_type, false)
        .unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        client.call(two_ints_request(&srv_type, 1, 1)),
    )
    .await
    .expect("Service call timed out");

    match result {
        Err(ServiceCallError::Rpc(message)) => {
            assert_eq!(message, "arithmetic is closed today")
        }
        other => panic!("Expected an RPC failure, got: {other:?}"),
    }
}
