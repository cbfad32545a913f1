//! At-rest value transformation.

use crate::errors::StoreError;
use async_trait::async_trait;
use serde_json::Value;

/// Transforms the `data` and `status` blobs between their API form and
/// their stored form, typically for encryption at rest. Configured per
/// group/kind on the factory; kinds without a transformer store plaintext.
#[async_trait]
pub trait ValueTransformer: Send + Sync {
    async fn to_storage(&self, plain: Value) -> Result<Value, StoreError>;

    async fn from_storage(&self, stored: Value) -> Result<Value, StoreError>;
}

/// Stores values unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransformer;

#[async_trait]
impl ValueTransformer for IdentityTransformer {
    async fn to_storage(&self, plain: Value) -> Result<Value, StoreError> {
        Ok(plain)
    }

    async fn from_storage(&self, stored: Value) -> Result<Value, StoreError> {
        Ok(stored)
    }
}
