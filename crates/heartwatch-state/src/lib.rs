//! heartwatch-state: durable store for device heartbeat state.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for device records, layered configuration overrides, and
//! throttled telemetry reports.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`device/{id}/{key}`, `{device_id}/{kind}`) enable
//! prefix scans for related records.
//!
//! Heartbeat writes go through [`StateStore::apply_heartbeat`], which reads
//! and writes the device row inside one write transaction and rejects
//! writes older than the row's last write timestamp.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
