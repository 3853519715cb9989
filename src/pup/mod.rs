//! The `Pup` abstraction: one contract over heterogeneous remote pinning
//! services.
//!
//! Each remote service ("pup") exposes the same three operations - list
//! currently pinned hashes, pin a hash, unpin a hash - behind wildly
//! different HTTP APIs. The adapters in this module normalize those into
//! a single trait so the publish pipeline and the reconciliation loop
//! never care which service they talk to.
//!
//! Adapters surface errors naming the backend and operation; they never
//! retry. Retry policy belongs to callers.

pub mod eternum;
pub mod pinata;
pub mod pipin;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use eternum::Eternum;
pub use pinata::Pinata;
pub use pipin::Pipin;

/// Opaque content-addressed identifier for a blob in the storage network.
///
/// Compared and hashed by its string representation; the structure of the
/// underlying multihash is never inspected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ContentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One entry as reported by a backend's listing call.
///
/// Produced fresh on every `fetch`; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamedHash {
    pub hash: ContentId,
    /// Filename or path, where the backend knows one.
    pub name: Option<String>,
    /// Size in bytes, where the backend reports one.
    pub size: Option<i64>,
}

impl NamedHash {
    pub fn bare(hash: impl Into<ContentId>) -> Self {
        Self {
            hash: hash.into(),
            name: None,
            size: None,
        }
    }
}

/// A backend adapter failure, naming the backend and operation.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{backend}: {op}: {source}")]
    Transport {
        backend: &'static str,
        op: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{backend}: {op} returned HTTP {status}")]
    Status {
        backend: &'static str,
        op: &'static str,
        status: reqwest::StatusCode,
    },

    #[error("{backend}: {op}: decoding response: {source}")]
    Decode {
        backend: &'static str,
        op: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

/// Uniform interface over a remote pinning service.
#[async_trait]
pub trait Pup: Send + Sync {
    /// Short stable name for logs and error messages.
    fn name(&self) -> &'static str;

    /// Retrieve the list of pinned hashes. If `filter` is non-empty, the
    /// returned list contains only hashes from the filter list. An empty
    /// result is not an error.
    async fn fetch(&self, filter: &[ContentId]) -> Result<Vec<NamedHash>, BackendError>;

    /// Request that the backend retain `hash`. Pinning an already-pinned
    /// hash succeeds.
    async fn pin(&self, hash: &ContentId) -> Result<(), BackendError>;

    /// Release the backend's pin on `hash`. Unpinning an absent hash
    /// succeeds.
    async fn unpin(&self, hash: &ContentId) -> Result<(), BackendError>;

    /// Point query for pin status. Backends without a native point query
    /// derive it from a filtered `fetch`.
    async fn is_pinned(&self, hash: &ContentId) -> Result<bool, BackendError> {
        let listed = self.fetch(std::slice::from_ref(hash)).await?;
        Ok(listed.iter().any(|n| &n.hash == hash))
    }
}

/// A configured backend plus its stable column index among all configured
/// backends. Created once at startup; immutable for the process lifetime.
#[derive(Clone)]
pub struct PinTarget {
    pub index: usize,
    pub name: String,
    pub backend: Arc<dyn Pup>,
}

impl fmt::Debug for PinTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinTarget")
            .field("index", &self.index)
            .field("name", &self.name)
            .finish()
    }
}

/// Restrict `list` to entries named in `filter`; an empty filter keeps
/// everything. Shared by adapters whose APIs have no server-side filter.
pub(crate) fn apply_filter(list: Vec<NamedHash>, filter: &[ContentId]) -> Vec<NamedHash> {
    if filter.is_empty() {
        return list;
    }
    let wanted: HashSet<&ContentId> = filter.iter().collect();
    list.into_iter()
        .filter(|n| wanted.contains(&n.hash))
        .collect()
}
