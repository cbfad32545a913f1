//! The store strategy: typed object semantics over the record log.
//!
//! A `Strategy<O>` maps objects of one kind onto records and drives the
//! create/update/status/delete rules: uid assignment, the generation
//! counter, the optimistic-version check and the tombstone transitions.
//! Serialization splits an object into three blobs: `metadata` (minus the
//! server-managed keys, which live in columns and are reconstituted on
//! read), `data` (the spec fields) and `status`.

use crate::context::Context;
use crate::errors::{translate_unique_violation, StoreError, OPTIMISTIC_LOCK_MESSAGE};
use crate::log::RecordLog;
use crate::record::{Criteria, Record, WatchCriteria};
use crate::transform::ValueTransformer;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
use mink_types::{
    FieldSelector, GroupVersionKind, LabelSelector, ListOptions, Object, ObjectList, Scheme,
    WatchEvent,
};
use sea_orm::{DatabaseTransaction, TransactionTrait};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Metadata keys owned by the server; stripped before the metadata blob is
/// stored and rebuilt from record columns on read.
const MANAGED_METADATA_KEYS: [&str; 7] = [
    "uid",
    "resourceVersion",
    "generation",
    "name",
    "namespace",
    "creationTimestamp",
    "deletionTimestamp",
];

#[derive(Debug, Serialize, Deserialize)]
struct ContinueToken {
    #[serde(default)]
    id: i64,
}

pub struct Strategy<O: Object> {
    log: Arc<RecordLog>,
    scheme: Arc<Scheme>,
    gvk: GroupVersionKind,
    partition_required: bool,
    transformer: Option<Arc<dyn ValueTransformer>>,
    _object: PhantomData<fn() -> O>,
}

impl<O: Object> Clone for Strategy<O> {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
            scheme: Arc::clone(&self.scheme),
            gvk: self.gvk.clone(),
            partition_required: self.partition_required,
            transformer: self.transformer.clone(),
            _object: PhantomData,
        }
    }
}

impl<O: Object> Strategy<O> {
    pub(crate) fn new(
        log: Arc<RecordLog>,
        scheme: Arc<Scheme>,
        partition_required: bool,
        transformer: Option<Arc<dyn ValueTransformer>>,
    ) -> Self {
        Self {
            log,
            scheme,
            gvk: O::group_version_kind(),
            partition_required,
            transformer,
            _object: PhantomData,
        }
    }

    pub fn scheme(&self) -> Arc<Scheme> {
        Arc::clone(&self.scheme)
    }

    pub fn group_version_kind(&self) -> &GroupVersionKind {
        &self.gvk
    }

    /// Stop the background tasks for this table. Safe to call more than
    /// once; in-flight watches end once their channels drain.
    pub fn destroy(&self) {
        self.log.shutdown();
    }

    /// Latest live version of the object, or not-found.
    pub async fn get(&self, ctx: &Context, namespace: &str, name: &str) -> Result<O, StoreError> {
        let partition_id = self.partition_id(ctx)?;
        let (records, _) = self
            .log
            .query(
                self.log.conn(),
                &Criteria {
                    name: name.to_string(),
                    namespace: Some(namespace.to_string()),
                    no_resource_version: true,
                    partition_id,
                    ..Default::default()
                },
            )
            .await?;
        match records.first() {
            Some(rec) => self.record_into_object(rec).await,
            None => Err(StoreError::not_found(&self.gvk, name)),
        }
    }

    /// Like `get`, but shaped as a single-item list carrying the
    /// collection's resource version. Zero items when the key is absent.
    pub async fn get_to_list(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
    ) -> Result<ObjectList<O>, StoreError> {
        let partition_id = self.partition_id(ctx)?;
        let (records, resource_version) = self
            .log
            .query(
                self.log.conn(),
                &Criteria {
                    name: name.to_string(),
                    namespace: Some(namespace.to_string()),
                    partition_id,
                    ..Default::default()
                },
            )
            .await?;

        let mut list = ObjectList {
            resource_version: resource_version.to_string(),
            ..Default::default()
        };
        if let Some(rec) = records.first() {
            list.items.push(self.record_into_object(rec).await?);
        }
        Ok(list)
    }

    pub async fn list(
        &self,
        ctx: &Context,
        namespace: &str,
        opts: &ListOptions,
    ) -> Result<ObjectList<O>, StoreError> {
        let partition_id = self.partition_id(ctx)?;

        let mut limit = opts.limit;
        if limit != 0 {
            // one extra row decides whether a continuation is needed
            limit += 1;
        }

        let mut criteria = Criteria {
            namespace: nil_on_empty(namespace),
            limit,
            label_selector: opts.label_selector.clone(),
            field_selector: opts.field_selector.clone(),
            partition_id,
            ..Default::default()
        };
        rewrite_identity_fields(
            opts.field_selector.as_ref(),
            &mut criteria.name,
            &mut criteria.namespace,
        );
        if !opts.continue_token.is_empty() {
            criteria.after = decode_continue(&opts.continue_token)?;
        }

        let (records, resource_version) = self.log.query(self.log.conn(), &criteria).await?;

        let mut items: Vec<O> = Vec::with_capacity(records.len());
        for rec in &records {
            let value = self.record_to_value(rec).await?;
            if !matches_value(
                opts.label_selector.as_ref(),
                opts.field_selector.as_ref(),
                &value,
            ) {
                continue;
            }
            items.push(serde_json::from_value(value)?);
        }

        let mut list = ObjectList {
            resource_version: resource_version.to_string(),
            ..Default::default()
        };
        if opts.limit != 0 && records.len() as i64 == limit {
            // the extra row exists: drop it and resume after the row
            // before it on the next page
            items.pop();
            list.continue_token = encode_continue(records[records.len() - 2].id)?;
            list.remaining_item_count = Some(1);
        }
        list.items = items;
        Ok(list)
    }

    pub async fn create(&self, ctx: &Context, obj: &O) -> Result<O, StoreError> {
        let partition_id = self.partition_id(ctx)?;
        let name = obj.metadata().name.clone();

        let txn = self.log.conn().begin().await?;
        match self.create_in(&txn, &partition_id, obj).await {
            Ok(created) => {
                txn.commit()
                    .await
                    .map_err(StoreError::from)
                    .map_err(|e| translate_unique_violation(e, &self.gvk, &name))?;
                self.log.trigger_watch();
                Ok(created)
            }
            Err(err) => {
                let _ = txn.rollback().await;
                Err(translate_unique_violation(err, &self.gvk, &name))
            }
        }
    }

    async fn create_in(
        &self,
        txn: &DatabaseTransaction,
        partition_id: &str,
        obj: &O,
    ) -> Result<O, StoreError> {
        let meta = obj.metadata();
        let (existing, _) = self
            .log
            .query(
                txn,
                &Criteria {
                    name: meta.name.clone(),
                    namespace: Some(meta.namespace.clone()),
                    limit: 1,
                    no_resource_version: true,
                    include_deleted: true,
                    include_gc: true,
                    partition_id: partition_id.to_string(),
                    ..Default::default()
                },
            )
            .await?;

        let mut rec = self.object_to_record(obj).await?;
        rec.create = true;
        rec.status = None;

        if let Some(prior) = existing.first() {
            if prior.removed.is_none() {
                return Err(StoreError::already_exists(&self.gvk, &meta.name));
            }
            // chain onto the tombstone so the removed history stays
            // connected; the new uid starts a new identity
            rec.previous = Some(prior.id);
        }
        rec.partition_id = partition_id.to_string();

        self.log.insert_in(txn, &mut rec).await?;
        self.record_into_object(&rec).await
    }

    pub async fn update(&self, ctx: &Context, obj: &O) -> Result<O, StoreError> {
        self.do_update(ctx, obj, false).await
    }

    pub async fn update_status(&self, ctx: &Context, obj: &O) -> Result<O, StoreError> {
        self.do_update(ctx, obj, true).await
    }

    /// Delete is an update: the caller supplies the object with a deletion
    /// timestamp (and possibly cleared finalizers) at the current resource
    /// version, and the tombstone transitions follow the update rules.
    pub async fn delete(&self, ctx: &Context, obj: &O) -> Result<O, StoreError> {
        self.update(ctx, obj).await
    }

    async fn do_update(&self, ctx: &Context, obj: &O, status_only: bool) -> Result<O, StoreError> {
        let partition_id = self.partition_id(ctx)?;
        let meta = obj.metadata();
        let name = meta.name.clone();

        let existing = self
            .get_existing(&partition_id, &meta.namespace, &name)
            .await?;

        if meta.resource_version != existing.id.to_string() {
            return Err(StoreError::conflict(&self.gvk, &name, OPTIMISTIC_LOCK_MESSAGE));
        }
        if !meta.uid.is_empty() && meta.uid != existing.uid {
            return Err(StoreError::conflict(
                &self.gvk,
                &name,
                format!(
                    "uid precondition failed: expected {}, object has {}",
                    existing.uid, meta.uid
                ),
            ));
        }

        let mut rec = self.object_to_record(obj).await?;
        rec.previous = Some(existing.id);
        rec.created = existing.created;
        rec.deleted = existing.deleted;
        rec.removed = existing.removed;
        rec.uid = existing.uid.clone();
        rec.partition_id = existing.partition_id.clone();
        rec.updated = Utc::now();

        if status_only {
            rec.generation = existing.generation;
            rec.data = existing.data.clone();
            rec.metadata = existing.metadata.clone();
        } else {
            if rec.deleted.is_none() {
                if let Some(ts) = meta.deletion_timestamp {
                    rec.deleted = Some(ts);
                }
            }
            if rec.removed.is_none() && rec.deleted.is_some() && meta.finalizers.is_empty() {
                rec.removed = Some(rec.updated);
            }

            if rec.metadata == existing.metadata && rec.data == existing.data {
                rec.generation = existing.generation;
            } else {
                rec.generation = existing.generation + 1;
                // status only moves through the status path
                rec.status = existing.status.clone();
            }
        }

        if let Err(err) = self.log.insert(&mut rec).await {
            return Err(translate_unique_violation(err, &self.gvk, &name));
        }
        self.record_into_object(&rec).await
    }

    /// Latest row for the key regardless of tombstone or garbage state.
    async fn get_existing(
        &self,
        partition_id: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Record, StoreError> {
        let (records, _) = self
            .log
            .query(
                self.log.conn(),
                &Criteria {
                    name: name.to_string(),
                    namespace: Some(namespace.to_string()),
                    limit: 1,
                    no_resource_version: true,
                    include_deleted: true,
                    include_gc: true,
                    partition_id: partition_id.to_string(),
                    ..Default::default()
                },
            )
            .await?;
        records
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::not_found(&self.gvk, name))
    }

    /// Open a typed watch. The stream ends when the returned receiver is
    /// dropped or the table shuts down.
    pub async fn watch(
        &self,
        ctx: &Context,
        namespace: &str,
        opts: &ListOptions,
    ) -> Result<mpsc::Receiver<WatchEvent<O>>, StoreError> {
        let partition_id = self.partition_id(ctx)?;

        let mut criteria = WatchCriteria {
            namespace: nil_on_empty(namespace),
            label_selector: opts.label_selector.clone(),
            field_selector: opts.field_selector.clone(),
            partition_id,
            ..Default::default()
        };
        rewrite_identity_fields(
            opts.field_selector.as_ref(),
            &mut criteria.name,
            &mut criteria.namespace,
        );
        if !opts.resource_version.is_empty() {
            criteria.after = opts
                .resource_version
                .parse()
                .map_err(|_| StoreError::InvalidResourceVersion(opts.resource_version.clone()))?;
        }

        let mut records = self.log.watch(criteria.clone()).await?;
        let (tx, rx) = mpsc::channel(1);
        let strategy = self.clone();
        let allow_bookmarks = opts.allow_watch_bookmarks;

        tokio::spawn(async move {
            while let Some(rec) = records.recv().await {
                // sentinel rows surface as bookmarks carrying the tip
                if rec.name.is_empty() {
                    if allow_bookmarks {
                        let event = WatchEvent::Bookmark {
                            resource_version: rec.id.to_string(),
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    continue;
                }

                // the live feed is table-wide; re-apply the watcher scope
                if !criteria.partition_id.is_empty() && rec.partition_id != criteria.partition_id {
                    continue;
                }
                if !criteria.name.is_empty() && rec.name != criteria.name {
                    continue;
                }
                if let Some(ns) = &criteria.namespace {
                    if rec.namespace != *ns {
                        continue;
                    }
                }

                let event = match strategy.record_to_value(&rec).await {
                    Err(err) => WatchEvent::Error(err.to_string()),
                    Ok(value) => {
                        if !matches_value(
                            criteria.label_selector.as_ref(),
                            criteria.field_selector.as_ref(),
                            &value,
                        ) {
                            continue;
                        }
                        match serde_json::from_value::<O>(value) {
                            Err(err) => WatchEvent::Error(err.to_string()),
                            Ok(obj) => {
                                if rec.create {
                                    WatchEvent::Added(obj)
                                } else if rec.removed.is_some() {
                                    WatchEvent::Deleted(obj)
                                } else {
                                    WatchEvent::Modified(obj)
                                }
                            }
                        }
                    }
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    fn partition_id(&self, ctx: &Context) -> Result<String, StoreError> {
        let id = ctx.partition_id().to_string();
        if self.partition_required && id.is_empty() {
            return Err(StoreError::PartitionRequired);
        }
        Ok(id)
    }

    async fn to_storage(&self, value: Value) -> Result<Value, StoreError> {
        match &self.transformer {
            Some(t) => t.to_storage(value).await,
            None => Ok(value),
        }
    }

    async fn from_storage(&self, value: Value) -> Result<Value, StoreError> {
        match &self.transformer {
            Some(t) => t.from_storage(value).await,
            None => Ok(value),
        }
    }

    /// Split an object into a fresh record: metadata blob without the
    /// managed keys, spec blob, status blob.
    async fn object_to_record(&self, obj: &O) -> Result<Record, StoreError> {
        let mut root = match serde_json::to_value(obj)? {
            Value::Object(map) => map,
            other => {
                return Err(StoreError::Internal(format!(
                    "object serialized to non-object JSON: {}",
                    other
                )))
            }
        };

        let mut metadata = match root.remove("metadata") {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for key in MANAGED_METADATA_KEYS {
            metadata.remove(key);
        }
        let status = root.remove("status");
        root.remove("kind");
        root.remove("apiVersion");

        let meta = obj.metadata();
        let now = Utc::now();
        let mut rec = Record::empty(now);
        rec.api_group = self.gvk.group.clone();
        rec.kind = self.gvk.kind.clone();
        rec.version = self.gvk.version.clone();
        rec.name = meta.name.clone();
        rec.namespace = meta.namespace.clone();
        rec.uid = Uuid::new_v4().to_string();
        rec.generation = 1;
        rec.metadata = Some(Value::Object(metadata));
        rec.data = Some(self.to_storage(Value::Object(root)).await?);
        rec.status = match status {
            Some(s) if !s.is_null() => Some(self.to_storage(s).await?),
            _ => None,
        };
        Ok(rec)
    }

    /// Reassemble the serialized object, reconstituting the managed
    /// metadata keys from the record columns.
    async fn record_to_value(&self, rec: &Record) -> Result<Value, StoreError> {
        let mut data = match rec.data.clone() {
            Some(stored) => match self.from_storage(stored).await? {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            None => Map::new(),
        };
        let mut metadata = match rec.metadata.clone() {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        if let Some(stored) = rec.status.clone() {
            let status = self.from_storage(stored).await?;
            if !status.is_null() {
                data.insert("status".to_string(), status);
            }
        }

        let gvk = GroupVersionKind::new(
            rec.api_group.clone(),
            rec.version.clone(),
            rec.kind.clone(),
        );
        data.insert("kind".to_string(), Value::String(gvk.kind.clone()));
        data.insert("apiVersion".to_string(), Value::String(gvk.api_version()));

        metadata.insert("uid".to_string(), Value::String(rec.uid.clone()));
        metadata.insert(
            "resourceVersion".to_string(),
            Value::String(rec.id.to_string()),
        );
        metadata.insert("name".to_string(), Value::String(rec.name.clone()));
        metadata.insert("namespace".to_string(), Value::String(rec.namespace.clone()));
        metadata.insert("generation".to_string(), Value::from(rec.generation));
        metadata.insert(
            "creationTimestamp".to_string(),
            Value::String(rec.created.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        if let Some(deleted) = rec.deleted {
            metadata.insert(
                "deletionTimestamp".to_string(),
                Value::String(deleted.to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
        }
        data.insert("metadata".to_string(), Value::Object(metadata));

        Ok(Value::Object(data))
    }

    async fn record_into_object(&self, rec: &Record) -> Result<O, StoreError> {
        let value = self.record_to_value(rec).await?;
        Ok(serde_json::from_value(value)?)
    }
}

fn nil_on_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// `metadata.name` and `metadata.namespace` equality requirements become
/// primary predicates instead of JSON probes.
fn rewrite_identity_fields(
    fields: Option<&FieldSelector>,
    name: &mut String,
    namespace: &mut Option<String>,
) {
    let Some(fields) = fields else { return };
    if let Some(n) = fields.required_value("metadata.name") {
        *name = n.to_string();
    }
    if namespace.is_none() {
        if let Some(ns) = fields.required_value("metadata.namespace") {
            *namespace = Some(ns.to_string());
        }
    }
}

/// In-memory re-check applied to every row before it is returned or
/// emitted; semantics match the pushed-down SQL probes.
fn matches_value(
    labels: Option<&LabelSelector>,
    fields: Option<&FieldSelector>,
    value: &Value,
) -> bool {
    if let Some(selector) = labels {
        if !selector.is_empty() {
            let label_map: BTreeMap<String, String> = value
                .pointer("/metadata/labels")
                .and_then(Value::as_object)
                .map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default();
            if !selector.matches(&label_map) {
                return false;
            }
        }
    }
    if let Some(selector) = fields {
        if !selector.matches(value) {
            return false;
        }
    }
    true
}

fn encode_continue(id: i64) -> Result<String, StoreError> {
    let token = serde_json::to_vec(&ContinueToken { id })?;
    Ok(BASE64.encode(token))
}

fn decode_continue(token: &str) -> Result<i64, StoreError> {
    let bytes = BASE64
        .decode(token)
        .map_err(|e| StoreError::InvalidContinueToken(e.to_string()))?;
    let token: ContinueToken = serde_json::from_slice(&bytes)
        .map_err(|e| StoreError::InvalidContinueToken(e.to_string()))?;
    Ok(token.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn continue_token_round_trip() {
        let token = encode_continue(42).unwrap();
        assert_eq!(decode_continue(&token).unwrap(), 42);
    }

    #[test]
    fn continue_token_rejects_garbage() {
        assert!(decode_continue("not-base64!").is_err());
        let not_json = BASE64.encode(b"not json");
        assert!(decode_continue(&not_json).is_err());
    }

    #[test]
    fn identity_fields_rewrite_into_primary_predicates() {
        let fields = FieldSelector::parse("metadata.name=p,metadata.namespace=ns").unwrap();
        let mut name = String::new();
        let mut namespace = None;
        rewrite_identity_fields(Some(&fields), &mut name, &mut namespace);
        assert_eq!(name, "p");
        assert_eq!(namespace.as_deref(), Some("ns"));
    }

    #[test]
    fn matches_value_checks_labels_and_fields() {
        let value = json!({
            "metadata": {"name": "p", "labels": {"app": "web"}},
            "spec": {"nodeName": "x"}
        });
        let labels = LabelSelector::parse("app=web").unwrap();
        let fields = FieldSelector::parse("spec.nodeName=x").unwrap();
        assert!(matches_value(Some(&labels), Some(&fields), &value));

        let other = LabelSelector::parse("app=db").unwrap();
        assert!(!matches_value(Some(&other), None, &value));
    }
}
