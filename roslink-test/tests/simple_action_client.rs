use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use roslink::{
    action::{GoalStatus, SimpleActionClient},
    msg::Value,
};

mod util;
use util::{
    action::MockActionServer,
    msg::{fibonacci, fibonacci_goal, fibonacci_result},
    setup, spin_in_background, wait_until,
};

async fn setup_action_pair() -> (
    roslink::Node,
    SimpleActionClient,
    MockActionServer,
    tracing_appender::non_blocking::WorkerGuard,
) {
    let (client_node, guard) = setup().await;
    let action_type = fibonacci();

    let client = SimpleActionClient::new(&client_node, "/fibonacci", &action_type)
        .await
        .unwrap();

    let server = MockActionServer::start(&client_node, "/fibonacci", &action_type).await;

    spin_in_background(&client_node);
    server.wait_for_wiring().await;

    (client_node, client, server, guard)
}

/// Goal runs to completion: Active, then a Succeeded result. The done
/// callback sees the terminal status and the result body.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn goal_succeeds_after_active() {
    let (_node, client, server, _guard) = setup_action_pair().await;

    let action_type = fibonacci();
    let done: Arc<Mutex<Option<(GoalStatus, Option<Vec<i32>>)>>> = Arc::new(Mutex::new(None));
    let active_count = Arc::new(AtomicUsize::new(0));

    {
        let done = done.clone();
        let active_count = active_count.clone();

        client
            .send_goal(
                fibonacci_goal(&action_type, 5),
                Some(Arc::new(move |status, result| {
                    let sequence = result.as_ref().map(|msg| {
                        msg.get("sequence")
                            .and_then(Value::as_array)
                            .map(|values| {
                                values.iter().filter_map(Value::as_i32).collect::<Vec<_>>()
                            })
                            .unwrap_or_default()
                    });

                    *done.lock().unwrap() = Some((status, sequence));
                })),
                Some(Arc::new(move || {
                    active_count.fetch_add(1, Ordering::Release);
                })),
                None,
            )
            .await
            .unwrap();
    }

    let goal_id = server.wait_for_goal().await;

    server.publish_status(&goal_id, GoalStatus::Active).await;

    // Wait for the client to see the transition before finishing the goal.
    tokio::time::timeout(
        Duration::from_secs(5),
        wait_until(|| async {
            Ok((active_count.load(Ordering::Acquire) > 0).then_some(()))
        }),
    )
    .await
    .expect("Active callback never fired")
    .unwrap();

    server
        .publish_result(
            &goal_id,
            GoalStatus::Succeeded,
            fibonacci_result(&action_type, &[0, 1, 1, 2, 3]),
        )
        .await;

    assert!(client.wait_for_result(Duration::from_secs(5)).await);

    let done = done.lock().unwrap().clone();
    let (status, sequence) = done.expect("Done callback never fired");

    assert_eq!(status, GoalStatus::Succeeded);
    assert_eq!(sequence, Some(vec![0, 1, 1, 2, 3]));
    assert_eq!(client.get_state().unwrap(), GoalStatus::Succeeded);
    assert_eq!(active_count.load(Ordering::Acquire), 1);
}

/// Goal finishes without ever reporting Active: the done callback fires,
/// the active callback never does.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn done_without_active_skips_active_callback() {
    let (_node, client, server, _guard) = setup_action_pair().await;

    let action_type = fibonacci();
    let done_count = Arc::new(AtomicUsize::new(0));
    let active_count = Arc::new(AtomicUsize::new(0));

    {
        let done_count = done_count.clone();
        let active_count = active_count.clone();

        client
            .send_goal(
                fibonacci_goal(&action_type, 1),
                Some(Arc::new(move |_status, _result| {
                    done_count.fetch_add(1, Ordering::Release);
                })),
                Some(Arc::new(move || {
                    active_count.fetch_add(1, Ordering::Release);
                })),
                None,
            )
            .await
            .unwrap();
    }

    let goal_id = server.wait_for_goal().await;

    server
        .publish_result(
            &goal_id,
            GoalStatus::Succeeded,
            fibonacci_result(&action_type, &[0]),
        )
        .await;

    assert!(client.wait_for_result(Duration::from_secs(5)).await);
    assert_eq!(done_count.load(Ordering::Acquire), 1);
    assert_eq!(
        active_count.load(Ordering::Acquire),
        0,
        "Active callback must not fire when the goal never went active"
    );
}

/// Cancellation path: Active goal is cancelled, server preempts, the done
/// callback fires exactly once with the Preempted status.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_goal_reports_preempted() {
    let (_node, client, server, _guard) = setup_action_pair().await;

    let action_type = fibonacci();
    let done_statuses: Arc<Mutex<Vec<GoalStatus>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let done_statuses = done_statuses.clone();

        client
            .send_goal(
                fibonacci_goal(&action_type, 100),
                Some(Arc::new(move |status, _result| {
                    done_statuses.lock().unwrap().push(status);
                })),
                None,
                None,
            )
            .await
            .unwrap();
    }

    let goal_id = server.wait_for_goal().await;
    server.publish_status(&goal_id, GoalStatus::Active).await;

    client.cancel_goal().await.unwrap();

    let cancelled_id = server.wait_for_cancel().await;
    assert_eq!(cancelled_id, goal_id);

    server.publish_status(&goal_id, GoalStatus::Preempting).await;
    server
        .publish_result(
            &goal_id,
            GoalStatus::Preempted,
            fibonacci_result(&action_type, &[]),
        )
        .await;

    assert!(client.wait_for_result(Duration::from_secs(5)).await);

    let statuses = done_statuses.lock().unwrap().clone();
    assert_eq!(
        statuses,
        vec![GoalStatus::Preempted],
        "Done callback must fire exactly once with Preempted"
    );
}

/// `send_goal_and_wait` returns the terminal state directly.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn send_goal_and_wait_returns_final_state() {
    let (_node, client, server, _guard) = setup_action_pair().await;

    let action_type = fibonacci();

    // Drive the server side while the client blocks.
    let driver = {
        let server_action_type = action_type.clone();
        async move {
            let goal_id = server.wait_for_goal().await;
            server.publish_status(&goal_id, GoalStatus::Active).await;
            server
                .publish_result(
                    &goal_id,
                    GoalStatus::Succeeded,
                    fibonacci_result(&server_action_type, &[0, 1, 1]),
                )
                .await;
        }
    };

    let (state, _) = tokio::join!(
        client.send_goal_and_wait(
            fibonacci_goal(&action_type, 3),
            Duration::from_secs(10),
            Duration::from_secs(5),
        ),
        driver,
    );

    assert_eq!(state.unwrap(), GoalStatus::Succeeded);
}
