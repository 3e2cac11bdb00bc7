//! heartwatch-core: types shared by every Heartwatch crate.
//!
//! Holds the heartbeat state model, the clock abstraction used for
//! change timestamps and TTLs, and the `heartwatch.toml` parser.

pub mod clock;
pub mod config;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock, duration_ms};
pub use config::{ConfigError, HeartwatchConfig};
pub use types::*;
