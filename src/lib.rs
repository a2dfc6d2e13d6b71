pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod log;
pub mod orchestration;
pub mod plan;
pub mod snapshot;
pub mod store;
pub mod util;
pub mod workspace;

pub use error::{Error, Result};
pub use orchestration::{Scheduler, SchedulerEvent};
pub use plan::Plan;
