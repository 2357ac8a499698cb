pub mod job;
pub mod manager;

pub use job::{Job, ValidatedShare, MAX_FUTURE_NTIME_SECS};
pub use manager::JobManager;
