//! Job model and lifecycle: state machine, backoff, leases, retries and the
//! dead-letter queue.

pub mod backoff;
pub mod dlq;
pub mod lease;
pub mod manager;
pub mod model;
pub mod retry;
pub mod state;

pub use dlq::DeadLetterQueue;
pub use lease::LeasePolicy;
pub use manager::JobManager;
pub use model::{Job, JobStats, NewJob};
pub use retry::RetryManager;
pub use state::JobState;
