//! Shared domain types for the Volodyslav scheduler core: the clock
//! abstraction and typed access to process-start configuration.

pub mod clock;
pub mod config;

pub use clock::{weekday_name, Clock, ManualClock, SystemClock};
pub use config::{Environment, EnvironmentError, RemoteLocation};
