#![allow(dead_code)]

use mink_store::{Factory, FactoryOptions, Strategy};
use mink_types::{GroupVersionKind, Object, ObjectMeta, Scheme};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodSpec {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub node_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodStatus {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
    pub status: PodStatus,
}

impl Object for Pod {
    fn group_version_kind() -> GroupVersionKind {
        GroupVersionKind::new("", "v1", "Pod")
    }

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

pub fn pod(namespace: &str, name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn pod_with_labels(namespace: &str, name: &str, labels: &[(&str, &str)]) -> Pod {
    let mut p = pod(namespace, name);
    p.metadata.labels = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    p
}

/// Opt-in logging for test debugging: `RUST_LOG=debug cargo test ...`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Fresh in-memory store per test; every factory gets its own database.
pub async fn new_store() -> (Factory, Strategy<Pod>) {
    new_store_with_options(FactoryOptions::default()).await
}

pub async fn new_store_with_options(options: FactoryOptions) -> (Factory, Strategy<Pod>) {
    init_tracing();
    let factory = Factory::connect(Arc::new(Scheme::new()), "sqlite::memory:", options)
        .await
        .expect("connect");
    let pods = factory.strategy::<Pod>().await.expect("strategy");
    (factory, pods)
}
