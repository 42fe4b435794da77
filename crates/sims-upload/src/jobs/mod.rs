//! Job store: durable job identity, the status event log, and final results
//!
//! Every status change is written together with its event in one
//! transaction. The event log is the authoritative history; a job's current
//! status always equals the status of its latest event.

pub mod memory;
pub mod store;
pub mod types;

pub use memory::MemoryJobStore;
pub use store::{JobStore, PgJobStore};
pub use types::{
    JobDetail, JobStatus, NewJob, ResultCounts, ResultUpdate, UploadJob, UploadJobEvent,
    UploadJobResult, DEFAULT_RECENT_JOBS_LIMIT, MAX_RECENT_JOBS_LIMIT,
};
