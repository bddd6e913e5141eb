use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::DavResult;

/// Opaque remote identifier of one stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobHandle(String);

impl BlobHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque remote identifier of a namespace (one per folder).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespaceId(String);

impl NamespaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The remote message channel file content is stored in.
///
/// Every call may fail independently. Implementations own any retry policy;
/// the engine only bounds each call with a timeout.
#[async_trait]
pub trait BlobChannel: Send + Sync {
    /// Store `data` as one blob inside `namespace`. `name` is a display hint only.
    async fn send(&self, namespace: &NamespaceId, name: &str, data: Vec<u8>)
        -> DavResult<BlobHandle>;

    async fn fetch(&self, handle: &BlobHandle) -> DavResult<Vec<u8>>;

    async fn delete(&self, handle: &BlobHandle) -> DavResult<()>;

    async fn create_namespace(&self, name: &str) -> DavResult<NamespaceId>;

    async fn delete_namespace(&self, namespace: &NamespaceId) -> DavResult<()>;
}
