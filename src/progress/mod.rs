// src/progress/mod.rs
// Progress snapshots: the file-backed store and the subscriber fan-out

pub mod monitor;
pub mod store;

pub use monitor::{AllJobsCallback, ProgressCallback, ProgressMonitor, SubscriptionId};
pub use store::{JobStatus, ProgressSnapshot, ProgressStore};
