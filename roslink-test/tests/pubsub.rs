use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use roslink::{node::NodeError, tcpros::subscription::MessageCallback};
use tokio::sync::mpsc;

mod util;
use util::{
    msg::{ros_string, string_data, string_msg},
    setup, sibling_node, spin_in_background, wait_for_subscriber_connections, wait_until,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn publish_to_remote_subscriber() {
    let (node, _guard) = setup().await;
    let second_node = sibling_node(&node, "/roslink_2").await;

    let string_type = ros_string();

    let publisher = node
        .advertise("/chatter", &string_type, 5, false, false)
        .await
        .unwrap();

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    let _subscriber = second_node
        .subscribe(
            "/chatter",
            &string_type,
            false,
            MessageCallback::message(move |msg| {
                let _ = msg_tx.send(string_data(&msg));
            }),
        )
        .await
        .unwrap();

    spin_in_background(&second_node);
    wait_for_subscriber_connections(&node, "/chatter", 1, Duration::from_secs(5)).await;

    for msg_id in 0..5 {
        publisher
            .publish(&string_msg(&string_type, &format!("Test message:{msg_id}")))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), msg_rx.recv())
            .await
            .expect("Timed out waiting for message")
            .expect("Subscriber channel closed");

        assert_eq!(received, format!("Test message:{msg_id}"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn publish_loopback() {
    let (node, _guard) = setup().await;
    let string_type = ros_string();

    let publisher = node
        .advertise("/chatter", &string_type, 5, false, false)
        .await
        .unwrap();

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    let _subscriber = node
        .subscribe(
            "/chatter",
            &string_type,
            false,
            MessageCallback::message(move |msg| {
                let _ = msg_tx.send(string_data(&msg));
            }),
        )
        .await
        .unwrap();

    spin_in_background(&node);
    wait_for_subscriber_connections(&node, "/chatter", 1, Duration::from_secs(5)).await;

    publisher
        .publish(&string_msg(&string_type, "hello"))
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_millis(500), msg_rx.recv())
        .await
        .expect("Message did not arrive within 500ms")
        .unwrap();

    assert_eq!(received, "hello");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscriber_gets_latched_msg() {
    let (node, _guard) = setup().await;
    let string_type = ros_string();

    let publisher = node
        .advertise("/latch_test", &string_type, 5, true, false)
        .await
        .unwrap();

    publisher
        .publish(&string_msg(&string_type, "cool beans"))
        .await
        .unwrap();

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    let _subscriber = node
        .subscribe(
            "/latch_test",
            &string_type,
            false,
            MessageCallback::message(move |msg| {
                let _ = msg_tx.send(string_data(&msg));
            }),
        )
        .await
        .unwrap();

    spin_in_background(&node);

    let latched = tokio::time::timeout(Duration::from_secs(5), msg_rx.recv())
        .await
        .expect("Timed out waiting for latched message")
        .unwrap();

    assert_eq!(latched, "cool beans", "Latched message did not match");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn publish_to_multiple_subscribers() {
    const NUM_SUBSCRIBERS: usize = 5;

    let (node, _guard) = setup().await;
    let string_type = ros_string();

    let publisher = node
        .advertise("/chatter", &string_type, 5, false, false)
        .await
        .unwrap();

    let rx_message_count = Arc::new(AtomicUsize::new(0));
    let mut subscriber_nodes = Vec::with_capacity(NUM_SUBSCRIBERS);
    let mut subscribers = Vec::with_capacity(NUM_SUBSCRIBERS);

    for id in 0..NUM_SUBSCRIBERS {
        let sub_node = sibling_node(&node, &format!("/subscriber_{id}")).await;
        let rx_message_count = rx_message_count.clone();

        let subscriber = sub_node
            .subscribe(
                "/chatter",
                &string_type,
                false,
                MessageCallback::message(move |_msg| {
                    rx_message_count.fetch_add(1, Ordering::Release);
                }),
            )
            .await
            .unwrap();

        spin_in_background(&sub_node);
        subscriber_nodes.push(sub_node);
        subscribers.push(subscriber);
    }

    wait_for_subscriber_connections(&node, "/chatter", NUM_SUBSCRIBERS, Duration::from_secs(5))
        .await;

    publisher
        .publish(&string_msg(&string_type, "Hello, world!"))
        .await
        .unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        wait_until(|| async {
            if rx_message_count.load(Ordering::Acquire) == NUM_SUBSCRIBERS {
                return Ok(Some(()));
            }

            Ok(None)
        }),
    )
    .await
    .expect("Timed out waiting for subscriber messages")
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn callbacks_preserve_wire_order_and_never_overlap() {
    const MESSAGE_COUNT: usize = 200;

    let (node, _guard) = setup().await;
    let second_node = sibling_node(&node, "/roslink_2").await;
    let string_type = ros_string();

    let publisher = node
        .advertise("/burst", &string_type, MESSAGE_COUNT, false, false)
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let in_callback = Arc::new(AtomicUsize::new(0));

    let subscriber = {
        let seen = seen.clone();
        let in_callback = in_callback.clone();

        second_node
            .subscribe(
                "/burst",
                &string_type,
                false,
                MessageCallback::message(move |msg| {
                    assert_eq!(
                        in_callback.fetch_add(1, Ordering::AcqRel),
                        0,
                        "Two callbacks ran concurrently"
                    );

                    seen.lock().unwrap().push(string_data(&msg));

                    in_callback.fetch_sub(1, Ordering::AcqRel);
                }),
            )
            .await
            .unwrap()
    };

    // A second callback on the same subscription shares the loop.
    {
        let in_callback = in_callback.clone();
        subscriber
            .add_callback(MessageCallback::event_only(move |_event| {
                assert_eq!(
                    in_callback.load(Ordering::Acquire),
                    0,
                    "Callback overlapped with another"
                );
            }))
            .await;
    }

    spin_in_background(&second_node);
    wait_for_subscriber_connections(&node, "/burst", 1, Duration::from_secs(5)).await;

    for msg_id in 0..MESSAGE_COUNT {
        publisher
            .publish(&string_msg(&string_type, &msg_id.to_string()))
            .await
            .unwrap();

        // Pace the burst so the bounded callback queue never overflows;
        // this test is about ordering, not backpressure.
        if msg_id % 50 == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    tokio::time::timeout(
        Duration::from_secs(10),
        wait_until(|| async {
            if seen.lock().unwrap().len() == MESSAGE_COUNT {
                return Ok(Some(()));
            }

            Ok(None)
        }),
    )
    .await
    .expect("Timed out waiting for the burst to drain")
    .unwrap();

    let seen = seen.lock().unwrap();
    let expected: Vec<String> = (0..MESSAGE_COUNT).map(|id| id.to_string()).collect();

    assert_eq!(*seen, expected, "Wire order was not preserved");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_registrations_are_rejected() {
    let (node, _guard) = setup().await;
    let string_type = ros_string();

    let _publisher = node
        .advertise("/chatter", &string_type, 5, false, false)
        .await
        .unwrap();

    let duplicate = node.advertise("/chatter", &string_type, 5, false, false).await;
    assert!(
        matches!(duplicate, Err(NodeError::Publisher(_))),
        "Second publisher on the same topic must be rejected"
    );

    let _subscriber = node
        .subscribe(
            "/chatter",
            &string_type,
            false,
            MessageCallback::message(|_| {}),
        )
        .await
        .unwrap();

    let duplicate = node
        .subscribe(
            "/chatter",
            &string_type,
            false,
            MessageCallback::message(|_| {}),
        )
        .await;

    assert!(
        matches!(duplicate, Err(NodeError::Subscriber(_))),
        "Second subscriber on the same topic must be rejected"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_callback_seeds_new_subscriber() {
    let (node, _guard) = setup().await;
    let second_node = sibling_node(&node, "/roslink_2").await;
    let string_type = ros_string();

    let greeting_type = string_type.clone();
    let publisher = node
        .advertise_with_callbacks(
            "/greeted",
            &string_type,
            5,
            false,
            false,
            move |single| {
                let greeting_type = greeting_type.clone();
                async move {
                    let greeting = string_msg(
                        &greeting_type,
                        &format!("welcome {}", single.subscriber_name()),
                    );

                    single.publish(&greeting).await.unwrap();
                }
            },
            |subscriber| {
                tracing::info!("subscriber \"{subscriber}\" left");
            },
        )
        .await
        .unwrap();

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    let _subscriber = second_node
        .subscribe(
            "/greeted",
            &string_type,
            false,
            MessageCallback::message(move |msg| {
                let _ = msg_tx.send(string_data(&msg));
            }),
        )
        .await
        .unwrap();

    spin_in_background(&second_node);

    let greeting = tokio::time::timeout(Duration::from_secs(5), msg_rx.recv())
        .await
        .expect("Timed out waiting for greeting")
        .unwrap();

    assert_eq!(greeting, "welcome /roslink_2");

    // Broadcast traffic reaches the peer after the greeting.
    wait_for_subscriber_connections(&node, "/greeted", 1, Duration::from_secs(5)).await;

    publisher
        .publish(&string_msg(&string_type, "to everyone"))
        .await
        .unwrap();

    let broadcast = tokio::time::timeout(Duration::from_secs(5), msg_rx.recv())
        .await
        .expect("Timed out waiting for broadcast")
        .unwrap();

    assert_eq!(broadcast, "to everyone");
}
