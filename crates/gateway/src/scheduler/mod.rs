pub mod cron;
pub mod model;
pub mod runner;
pub mod store;
pub mod validation;

pub use model::{Automation, ExecutionRecord, ExecutionStatus, ScheduleConfig};
pub use runner::{AutomationScheduler, FireFn, FireRequest};
pub use store::AutomationStore;
