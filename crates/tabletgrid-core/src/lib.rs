pub mod clock;
pub mod config;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ApiConfig, SchedulerConfig, TabletGridConfig};
pub use types::*;
