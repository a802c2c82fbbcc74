//! # relay-protocol: shared contract for the relay action pipeline
//!
//! This crate defines the types that cross the boundary between the action
//! service and its collaborators: action identity and state, the request and
//! response envelopes exchanged with the server, cached storage entries, and
//! the port traits that storage, transport, event and render backends
//! implement.
//!
//! It carries no runtime dependencies (no tokio, no HTTP client) so it can be
//! used as a pure contract crate by backends and test doubles.
//!
//! ## Module Overview
//!
//! - [`ids`]: ActionId and StorageKey
//! - [`action`]: ActionState, Priority, ActionOutcome, ActionInvocation
//! - [`wire`]: request/response envelopes and transport frames
//! - [`storage`]: StoredEntry with expiry bookkeeping
//! - [`ports`]: storage, transport, event bus, render and context ports
//! - [`error`]: ClientError, ClientResult

pub mod action;
pub mod error;
pub mod ids;
pub mod ports;
pub mod storage;
pub mod wire;

pub use action::{ActionInvocation, ActionOutcome, ActionState, Priority};
pub use error::{ClientError, ClientResult};
pub use ids::{ActionId, StorageKey};
pub use ports::{ActionStoragePort, ContextPort, EventBusPort, RenderPort, TransportPort};
pub use storage::StoredEntry;
pub use wire::{
    ActionResponse, ErrorPayload, RequestEnvelope, ResponseEnvelope, ServerEvent, TransportRequest,
    TransportResponse,
};
