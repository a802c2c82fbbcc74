//! # relay-runtime: the client action pipeline
//!
//! [`ActionService`] accepts actions, answers storable ones from the cache
//! when it can, runs local actions in enqueue order and bundles the rest into
//! requests over a bounded pool of connection slots.
//!
//! A processing pass walks the queue, waits for every cache lookup of the
//! walk through a counter join, then flushes. At most one pass is active;
//! work that arrives mid-pass is picked up by the same pass or the next one.
//!
//! ## Module Overview
//!
//! - [`action`]: Action handle, callbacks and state transitions
//! - [`registry`]: action definitions by descriptor
//! - [`pool`]: connection slots and idle tasks
//! - [`dedup`]: in-flight storable actions by storage key
//! - [`join`]: counter join for one walk
//! - [`decode`]: transport response classification
//! - [`events`]: broadcast event hub
//! - [`context`]: in-memory request context
//! - [`config`]: service configuration
//! - [`service`]: the processing loop and public API

pub mod action;
mod collector;
pub mod config;
pub mod context;
pub mod decode;
pub mod dedup;
mod detached;
pub mod events;
pub mod join;
pub mod pool;
pub mod registry;
pub mod service;

pub use action::{Action, ActionCallback, ClientHandler, ComponentHandle};
pub use config::{BatchPolicy, ClientExecution, Mode, ServiceConfig, StoredCompletion};
pub use context::{NoopRenderer, SharedContext};
pub use events::{ClientEvent, ClientEventHub};
pub use registry::{ActionDef, ActionDefinitions, ActionRegistry};
pub use service::{ActionService, LoopPhase, ServicePorts, ServiceSnapshot, TOKEN_STORAGE_KEY};
