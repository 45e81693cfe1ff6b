//! Shared building blocks for the cadence workspace: configuration,
//! identity keys, the clock abstraction and the core error type.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CadenceConfig, SchedulerConfig, StoreConfig, StoreKind};
pub use clock::millis;
pub use error::{CoreError, Result};
pub use types::{JobKey, TriggerKey, DEFAULT_GROUP};
