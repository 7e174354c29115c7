use std::time::Duration;

mod util;
use util::{setup, sibling_node, wait_until};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn set_get_round_trip() {
    let (node, _guard) = setup().await;

    node.set_param("/meaning_of_life", 42).await.unwrap();

    let param: Option<i32> = node.get_param("/meaning_of_life").await.unwrap();
    assert_eq!(param, Some(42));

    let missing: Option<i32> = node.get_param("/unset_key").await.unwrap();
    assert_eq!(missing, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn has_and_delete() {
    let (node, _guard) = setup().await;

    node.set_param("/transient", String::from("here")).await.unwrap();
    assert!(node.has_param("/transient").await.unwrap());

    node.delete_param("/transient").await.unwrap();
    assert!(!node.has_param("/transient").await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn param_names_include_set_keys() {
    let (node, _guard) = setup().await;

    node.set_param("/listed_key", 7).await.unwrap();

    let names = node.get_param_names().await.unwrap();
    assert!(
        names.iter().any(|name| name == "/listed_key"),
        "Expected /listed_key in {names:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cached_param_tracks_remote_updates() {
    let (node, _guard) = setup().await;
    let other_node = sibling_node(&node, "/param_writer").await;

    node.set_param("/tracked", 1).await.unwrap();

    // First cached read subscribes to updates.
    let cached: Option<i32> = node.get_param_cached("/tracked").await.unwrap();
    assert_eq!(cached, Some(1));

    // A write from elsewhere must reach the cache via paramUpdate.
    other_node.set_param("/tracked", 2).await.unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        wait_until(|| async {
            let cached: Option<i32> = node.get_param_cached("/tracked").await?;

            if cached == Some(2) {
                return Ok(Some(()));
            }

            Ok(None)
        }),
    )
    .await
    .expect("Cached parameter never saw the remote update")
    .unwrap();
}
