//! Append-only, versioned object store over a relational database.
//!
//! Every kind gets one table of immutable records keyed by a monotonic id.
//! Writes append; the only mutations ever applied to an existing row are
//! the `latest` flip when a successor lands and the `garbage` flip during
//! compaction. On top of the log sit a live change feed with resumable
//! watches, optimistic concurrency keyed on the record id, and a
//! compaction/garbage-collection pair bounded by per-table retention
//! windows.
//!
//! Entry point is [`Factory`]: connect it to a `sqlite://`, `mysql://` or
//! `postgres://` DSN, then build one [`Strategy`] per object type.
//!
//! ```no_run
//! # use mink_store::{Context, Factory, FactoryOptions};
//! # use mink_types::{GroupVersionKind, Object, ObjectMeta, Scheme};
//! # use std::sync::Arc;
//! # #[derive(Clone, serde::Serialize, serde::Deserialize)]
//! # struct Widget { metadata: ObjectMeta }
//! # impl Object for Widget {
//! #     fn group_version_kind() -> GroupVersionKind { GroupVersionKind::new("", "v1", "Widget") }
//! #     fn metadata(&self) -> &ObjectMeta { &self.metadata }
//! #     fn metadata_mut(&mut self) -> &mut ObjectMeta { &mut self.metadata }
//! # }
//! # async fn demo() -> Result<(), mink_store::StoreError> {
//! let factory = Factory::connect(
//!     Arc::new(Scheme::new()),
//!     "sqlite://mink.db?mode=rwc",
//!     FactoryOptions::default(),
//! )
//! .await?;
//! let widgets = factory.strategy::<Widget>().await?;
//! let ctx = Context::default();
//! let list = widgets.list(&ctx, "", &Default::default()).await?;
//! # drop(list);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod errors;
pub mod factory;
pub mod log;
pub mod metrics;
pub mod record;
pub mod strategy;
pub mod transform;

mod gc;
mod recovery;
mod sql;
mod watch;

pub use config::RetentionConfig;
pub use context::Context;
pub use errors::{StoreError, OPTIMISTIC_LOCK_MESSAGE};
pub use factory::{Factory, FactoryOptions};
pub use log::RecordLog;
pub use metrics::StoreMetrics;
pub use record::{Criteria, Record, WatchCriteria};
pub use strategy::Strategy;
pub use transform::{IdentityTransformer, ValueTransformer};
