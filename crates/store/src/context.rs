//! Per-request context.

/// Values the HTTP boundary attaches to a request before it reaches the
/// store. Today that is only the partition id.
#[derive(Debug, Clone, Default)]
pub struct Context {
    partition_id: String,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partition_id(partition_id: impl Into<String>) -> Self {
        Self {
            partition_id: partition_id.into(),
        }
    }

    /// Empty when the caller did not scope the request to a partition.
    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }
}
