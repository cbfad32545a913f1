//! Retention configuration.
//!
//! Compaction and deletion are tuned per table through environment
//! variables, looked up with a `KEY_<UPPERTABLE>` > `KEY_<table>` > `KEY`
//! precedence. The values are captured once when the table starts so tests
//! and embedders can also inject a config directly.

use crate::errors::StoreError;
use std::env;
use std::time::Duration;

pub const COMPACT_RETAIN_ENV: &str = "MINK_COMPACT_RETAIN";
pub const DELETE_RETAIN_ENV: &str = "MINK_DELETE_RETAIN";
pub const GC_INTERVAL_ENV: &str = "MINK_GC_INTERVAL_SECONDS";

pub(crate) const DEFAULT_COMPACT_RETAIN: i64 = 1000;
pub(crate) const DEFAULT_DELETE_RETAIN: i64 = 1000;
pub(crate) const DEFAULT_GC_INTERVAL_SECONDS: u64 = 1800;

/// How much history a table keeps.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Number of most recent ids kept ahead of the compaction horizon.
    /// Zero disables compaction and deletion entirely.
    pub compact_retain: i64,
    /// Number of most recent garbage rows kept after compaction. Zero
    /// disables deletion only.
    pub delete_retain: i64,
    /// Base period between GC passes; each pass is jittered above this.
    pub gc_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            compact_retain: DEFAULT_COMPACT_RETAIN,
            delete_retain: DEFAULT_DELETE_RETAIN,
            gc_interval: Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS),
        }
    }
}

impl RetentionConfig {
    /// Resolve the retention tuning for a table from the environment,
    /// falling back to the defaults. Invalid values fail table start
    /// instead of being discovered later inside the GC task.
    pub fn from_env(table: &str) -> Result<Self, StoreError> {
        Ok(Self {
            compact_retain: lookup(COMPACT_RETAIN_ENV, table)?.unwrap_or(DEFAULT_COMPACT_RETAIN),
            delete_retain: lookup(DELETE_RETAIN_ENV, table)?.unwrap_or(DEFAULT_DELETE_RETAIN),
            gc_interval: Duration::from_secs(
                lookup(GC_INTERVAL_ENV, table)?
                    .map(|v| v.max(0) as u64)
                    .unwrap_or(DEFAULT_GC_INTERVAL_SECONDS),
            ),
        })
    }
}

fn lookup(key: &str, table: &str) -> Result<Option<i64>, StoreError> {
    let names = [
        format!("{}_{}", key, table.to_uppercase()),
        format!("{}_{}", key, table),
        key.to_string(),
    ];
    for name in names {
        let Ok(value) = env::var(&name) else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        return value
            .parse::<i64>()
            .map(Some)
            .map_err(|e| StoreError::Config(format!("invalid value {}={}: {}", name, value, e)));
    }
    Ok(None)
}
