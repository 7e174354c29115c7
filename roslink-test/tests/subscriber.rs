use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use roslink::{
    msg::{FieldSpec, FieldType, MessageSchema, MessageType},
    tcpros::subscription::MessageCallback,
};

mod util;
use util::{
    msg::{ros_string, string_msg},
    setup, sibling_node, spin_in_background, wait_for_publisher_connections,
    wait_for_subscriber_connections, wait_until,
};

/// Removing one publisher from the graph must tear down exactly that
/// link and leave the surviving one untouched.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn publisher_list_update_tears_down_only_dead_peers() {
    let (sub_node, _guard) = setup().await;
    let pub_node_1 = sibling_node(&sub_node, "/talker_1").await;
    let pub_node_2 = sibling_node(&sub_node, "/talker_2").await;

    let string_type = ros_string();

    let _pub_1 = pub_node_1
        .advertise("/chat", &string_type, 5, false, false)
        .await
        .unwrap();

    let pub_2 = pub_node_2
        .advertise("/chat", &string_type, 5, false, false)
        .await
        .unwrap();

    let received = Arc::new(AtomicUsize::new(0));

    let _subscriber = {
        let received = received.clone();
        sub_node
            .subscribe(
                "/chat",
                &string_type,
                false,
                MessageCallback::message(move |_| {
                    received.fetch_add(1, Ordering::Release);
                }),
            )
            .await
            .unwrap()
    };

    spin_in_background(&sub_node);
    wait_for_publisher_connections(&sub_node, "/chat", 2, Duration::from_secs(5)).await;

    let survivor_uri = pub_node_2.url().to_string();

    // Taking down the first talker triggers a publisherUpdate naming only
    // the survivor.
    pub_node_1.shutdown_and_wait(None).await.unwrap();

    let remaining = tokio::time::timeout(
        Duration::from_secs(5),
        wait_until(|| async {
            let connected = sub_node
                .get_connected_publisher_uris("/chat")
                .await?
                .unwrap_or_default();

            if connected.len() == 1 {
                return Ok(Some(connected));
            }

            Ok(None)
        }),
    )
    .await
    .expect("Timed out waiting for dead publisher teardown")
    .unwrap();

    assert!(
        remaining.contains(survivor_uri.trim_end_matches('/'))
            || remaining.contains(&survivor_uri),
        "Surviving publisher was torn down: {remaining:?}"
    );

    // The surviving link still delivers.
    let before = received.load(Ordering::Acquire);
    pub_2
        .publish(&string_msg(&string_type, "still here"))
        .await
        .unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        wait_until(|| async {
            if received.load(Ordering::Acquire) > before {
                return Ok(Some(()));
            }

            Ok(None)
        }),
    )
    .await
    .expect("Surviving publisher stopped delivering")
    .unwrap();
}

/// A publisher with a different md5sum must be rejected during the
/// handshake; no link forms and no callback fires.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn incompatible_md5sum_aborts_connection() {
    let (sub_node, _guard) = setup().await;
    let pub_node = sibling_node(&sub_node, "/imposter").await;

    // Same type name and topic, different fingerprint and layout.
    let imposter_type = MessageType::with_md5(
        "std_msgs/String",
        "uint32 data\n",
        "0123456789abcdef0123456789abcdef",
        MessageSchema::new(vec![FieldSpec::scalar("data", FieldType::U32)]),
    );

    let _publisher = pub_node
        .advertise("/chat", &imposter_type, 5, false, false)
        .await
        .unwrap();

    let callback_fired = Arc::new(AtomicUsize::new(0));

    let _subscriber = {
        let callback_fired = callback_fired.clone();
        sub_node
            .subscribe(
                "/chat",
                &ros_string(),
                false,
                MessageCallback::message(move |_| {
                    callback_fired.fetch_add(1, Ordering::Release);
                }),
            )
            .await
            .unwrap()
    };

    spin_in_background(&sub_node);

    // Give discovery ample time to attempt (and abort) the handshake.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let connected = sub_node
        .get_connected_publisher_uris("/chat")
        .await
        .unwrap()
        .unwrap_or_default();

    assert!(
        connected.is_empty(),
        "Mismatched publisher must not stay connected: {connected:?}"
    );
    assert_eq!(callback_fired.load(Ordering::Acquire), 0);
}

/// When the remote end closes, the link disappears from the connection
/// table without waiting for a new publisher list.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_close_removes_link() {
    let (sub_node, _guard) = setup().await;
    let pub_node = sibling_node(&sub_node, "/talker").await;

    let string_type = ros_string();

    let publisher = pub_node
        .advertise("/chat", &string_type, 5, false, false)
        .await
        .unwrap();

    let _subscriber = sub_node
        .subscribe(
            "/chat",
            &string_type,
            false,
            MessageCallback::message(|_| {}),
        )
        .await
        .unwrap();

    spin_in_background(&sub_node);
    wait_for_subscriber_connections(&pub_node, "/chat", 1, Duration::from_secs(5)).await;

    // Closing the publication drops the TCP connection out from under the
    // subscriber.
    publisher.shutdown().await.unwrap();

    tokio::time::timeout(
        Duration::from_secs(2),
        wait_until(|| async {
            let connected = sub_node
                .get_connected_publisher_uris("/chat")
                .await?
                .unwrap_or_default();

            if connected.is_empty() {
                return Ok(Some(()));
            }

            Ok(None)
        }),
    )
    .await
    .expect("Timed out waiting for disconnect propagation")
    .unwrap();
}
