//! Runtime ports between the action service and its collaborators.
//!
//! Storage and transport are asynchronous and use `async-trait` for dyn
//! dispatch. Event, render and context ports are synchronous: the service calls
//! them between suspension points and never while holding its own state lock.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ClientResult;
use crate::storage::StoredEntry;
use crate::wire::{TransportRequest, TransportResponse};

/// Key-value cache for storable action responses.
#[async_trait]
pub trait ActionStoragePort: Send + Sync {
    /// Look up an entry. Expired entries are only returned when
    /// `include_expired` is set.
    async fn get(&self, key: &str, include_expired: bool) -> ClientResult<Option<StoredEntry>>;
    /// Store a value, restarting its expiry clock.
    async fn put(&self, key: &str, value: Value) -> ClientResult<()>;
    async fn remove(&self, key: &str) -> ClientResult<()>;
    async fn keys(&self) -> ClientResult<Vec<String>>;
    /// Whether entries survive the process.
    fn is_persistent(&self) -> bool;
}

/// Submits one encoded request and resolves with the raw completion.
///
/// A returned error means the request never completed (no connection,
/// refused, reset) and is treated as an incomplete round trip.
#[async_trait]
pub trait TransportPort: Send + Sync {
    async fn send(&self, request: TransportRequest) -> ClientResult<TransportResponse>;
}

pub trait EventBusPort: Send + Sync {
    fn fire(&self, name: &str, payload: Value);
    fn has_handlers(&self, name: &str) -> bool;
}

pub trait RenderPort: Send + Sync {
    fn rerender_dirty(&self);
}

/// Request context shared with the server.
pub trait ContextPort: Send + Sync {
    fn encode_for_server(&self) -> ClientResult<String>;
    fn merge(&self, pushed: &Value) -> ClientResult<()>;
    /// Whether the current context was restored from persistent storage,
    /// which is what makes persisted cache entries visible to it.
    fn restored_from_storage(&self) -> bool {
        true
    }
}
