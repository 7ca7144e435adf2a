//! queuectl: persistent job queue with leased workers, retries and a
//! dead-letter queue.

pub mod config;
pub mod error;
pub mod jobs;
pub mod store;
pub mod worker;
