use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use mink_store::{Context, Factory, FactoryOptions};
use mink_types::{GroupVersionKind, ListOptions, Object, ObjectMeta, Scheme};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct GcWidget {
    metadata: ObjectMeta,
    spec: WidgetSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct WidgetSpec {
    revision: i64,
}

impl Object for GcWidget {
    fn group_version_kind() -> GroupVersionKind {
        GroupVersionKind::new("test.mink.io", "v1", "GcWidget")
    }

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Aggressive per-table retention so a test observes a full
/// compact-and-delete cycle in seconds. The env keys are scoped to this
/// table name and do not affect the other integration tests.
fn configure_fast_gc() {
    std::env::set_var("MINK_GC_INTERVAL_SECONDS_GCWIDGET", "1");
    std::env::set_var("MINK_COMPACT_RETAIN_GCWIDGET", "5");
    std::env::set_var("MINK_DELETE_RETAIN_GCWIDGET", "2");
}

#[tokio::test]
async fn compaction_expires_old_resume_points_but_keeps_latest_state() -> anyhow::Result<()> {
    configure_fast_gc();

    let factory = Factory::connect(
        Arc::new(Scheme::new()),
        "sqlite::memory:",
        FactoryOptions::default(),
    )
    .await?;
    let widgets = factory.strategy::<GcWidget>().await?;
    let ctx = Context::default();

    let mut current = widgets
        .create(
            &ctx,
            &GcWidget {
                metadata: ObjectMeta {
                    name: "w".to_string(),
                    namespace: "ns".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .await?;

    // build enough history to push the tip well past the retain window
    for revision in 1..=30 {
        current.spec.revision = revision;
        current = widgets.update(&ctx, &current).await?;
    }

    // wait for the horizon to advance past the earliest versions
    let opts = ListOptions {
        resource_version: "1".to_string(),
        ..Default::default()
    };
    let mut expired = false;
    for _ in 0..60 {
        match widgets.watch(&ctx, "", &opts).await {
            Err(err) if err.is_resource_expired() => {
                expired = true;
                break;
            }
            Err(err) => panic!("unexpected watch error: {}", err),
            Ok(_) => sleep(Duration::from_millis(500)).await,
        }
    }
    assert!(expired, "watch below the horizon must report resource-expired");

    // a continuation below the horizon is equally unusable
    let stale_token = BASE64.encode(br#"{"id":1}"#);
    let opts = ListOptions {
        limit: 1,
        continue_token: stale_token,
        ..Default::default()
    };
    let err = widgets.list(&ctx, "ns", &opts).await.unwrap_err();
    assert!(err.is_resource_expired());

    // the latest state is untouched by compaction
    let fetched = widgets.get(&ctx, "ns", "w").await?;
    assert_eq!(fetched.spec.revision, 30);
    assert_eq!(fetched.metadata.uid, current.metadata.uid);

    // and the key remains fully writable
    current.spec.revision = 31;
    let updated = widgets.update(&ctx, &current).await?;
    assert_eq!(updated.spec.revision, 31);

    widgets.destroy();
    Ok(())
}
