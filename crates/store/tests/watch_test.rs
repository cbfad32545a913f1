mod common;

use common::{new_store, pod, pod_with_labels, Pod};
use mink_store::Context;
use mink_types::{LabelSelector, ListOptions, WatchEvent};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const EVENT_WAIT: Duration = Duration::from_secs(10);

async fn next_event(rx: &mut mpsc::Receiver<WatchEvent<Pod>>) -> WatchEvent<Pod> {
    timeout(EVENT_WAIT, rx.recv())
        .await
        .expect("timed out waiting for watch event")
        .expect("watch stream ended unexpectedly")
}

fn added_name(event: &WatchEvent<Pod>) -> &str {
    match event {
        WatchEvent::Added(p) => &p.metadata.name,
        other => panic!("expected Added, got {:?}", other),
    }
}

fn resource_version(event: &WatchEvent<Pod>) -> i64 {
    event
        .object()
        .expect("event carries an object")
        .metadata
        .resource_version
        .parse()
        .expect("numeric resource version")
}

#[tokio::test]
async fn watch_streams_creates_in_order() {
    let (_factory, pods) = new_store().await;
    let ctx = Context::default();

    pods.create(&ctx, &pod("ns", "p0")).await.expect("create");

    let opts = ListOptions {
        resource_version: "1".to_string(),
        ..Default::default()
    };
    let mut rx = pods.watch(&ctx, "", &opts).await.expect("watch");

    for i in 1..4 {
        pods.create(&ctx, &pod("ns", &format!("p{}", i)))
            .await
            .expect("create");
    }

    let mut last_rv = 0;
    for i in 1..4 {
        let event = next_event(&mut rx).await;
        assert_eq!(added_name(&event), format!("p{}", i));
        let rv = resource_version(&event);
        assert!(rv > last_rv, "resource versions must strictly increase");
        last_rv = rv;
    }
    assert_eq!(last_rv, 4);
}

#[tokio::test]
async fn watch_resumes_without_redelivery() {
    let (_factory, pods) = new_store().await;
    let ctx = Context::default();

    pods.create(&ctx, &pod("ns", "p0")).await.expect("create");

    let opts = ListOptions {
        resource_version: "1".to_string(),
        ..Default::default()
    };
    let mut rx = pods.watch(&ctx, "", &opts).await.expect("watch");

    for i in 1..4 {
        pods.create(&ctx, &pod("ns", &format!("p{}", i)))
            .await
            .expect("create");
    }
    let mut last_rv = 0;
    for _ in 1..4 {
        last_rv = resource_version(&next_event(&mut rx).await);
    }

    // kill the watch and resume from the last observed version
    drop(rx);
    let opts = ListOptions {
        resource_version: last_rv.to_string(),
        ..Default::default()
    };
    let mut resumed = pods.watch(&ctx, "", &opts).await.expect("re-watch");

    pods.create(&ctx, &pod("ns", "p4")).await.expect("create");

    let event = next_event(&mut resumed).await;
    assert_eq!(added_name(&event), "p4", "no events may be redelivered");
    assert_eq!(resource_version(&event), last_rv + 1);
}

#[tokio::test]
async fn watch_replays_catch_up_before_live_events() {
    let (_factory, pods) = new_store().await;
    let ctx = Context::default();

    pods.create(&ctx, &pod("ns", "a")).await.expect("create");
    pods.create(&ctx, &pod("ns", "b")).await.expect("create");

    // no resume point: everything is replayed
    let mut rx = pods
        .watch(&ctx, "", &ListOptions::default())
        .await
        .expect("watch");

    assert_eq!(added_name(&next_event(&mut rx).await), "a");
    assert_eq!(added_name(&next_event(&mut rx).await), "b");

    pods.create(&ctx, &pod("ns", "c")).await.expect("create");
    assert_eq!(added_name(&next_event(&mut rx).await), "c");
}

#[tokio::test]
async fn watch_applies_label_selectors_per_event() {
    let (_factory, pods) = new_store().await;
    let ctx = Context::default();

    let opts = ListOptions {
        label_selector: Some(LabelSelector::parse("app=web").expect("selector")),
        ..Default::default()
    };
    let mut rx = pods.watch(&ctx, "", &opts).await.expect("watch");

    pods.create(&ctx, &pod_with_labels("ns", "other", &[("app", "db")]))
        .await
        .expect("create");
    pods.create(&ctx, &pod_with_labels("ns", "web-1", &[("app", "web")]))
        .await
        .expect("create");

    let event = next_event(&mut rx).await;
    assert_eq!(added_name(&event), "web-1", "non-matching events are filtered");
}

#[tokio::test]
async fn watch_sees_updates_and_deletes() {
    let (_factory, pods) = new_store().await;
    let ctx = Context::default();

    let created = pods.create(&ctx, &pod("ns", "p")).await.expect("create");

    let opts = ListOptions {
        resource_version: created.metadata.resource_version.clone(),
        ..Default::default()
    };
    let mut rx = pods.watch(&ctx, "", &opts).await.expect("watch");

    let mut updated = created.clone();
    updated.spec.node_name = "x".to_string();
    let updated = pods.update(&ctx, &updated).await.expect("update");

    match next_event(&mut rx).await {
        WatchEvent::Modified(p) => assert_eq!(p.spec.node_name, "x"),
        other => panic!("expected Modified, got {:?}", other),
    }

    let mut doomed = updated.clone();
    doomed.metadata.deletion_timestamp = Some(chrono::Utc::now());
    pods.delete(&ctx, &doomed).await.expect("delete");

    match next_event(&mut rx).await {
        WatchEvent::Deleted(p) => assert_eq!(p.metadata.name, "p"),
        other => panic!("expected Deleted, got {:?}", other),
    }
}

#[tokio::test]
async fn watch_scopes_to_namespace() {
    let (_factory, pods) = new_store().await;
    let ctx = Context::default();

    let mut rx = pods
        .watch(&ctx, "watched", &ListOptions::default())
        .await
        .expect("watch");

    pods.create(&ctx, &pod("elsewhere", "x")).await.expect("create");
    pods.create(&ctx, &pod("watched", "y")).await.expect("create");

    let event = next_event(&mut rx).await;
    assert_eq!(added_name(&event), "y");
}

#[tokio::test]
async fn destroy_ends_watch_streams() {
    let (_factory, pods) = new_store().await;
    let ctx = Context::default();

    let mut rx = pods
        .watch(&ctx, "", &ListOptions::default())
        .await
        .expect("watch");

    pods.destroy();

    let ended = timeout(EVENT_WAIT, async {
        while rx.recv().await.is_some() {}
    })
    .await;
    assert!(ended.is_ok(), "watch stream must close on destroy");
}
