//! Worker system: command execution, polling loops and the pool that owns
//! them.
//!
//! - `executor`: runs a job's command (shell or reserved directive)
//! - `worker`: claim → execute → record loop for one worker
//! - `pool`: starts workers, snapshots them, drains them on stop

pub mod executor;
pub mod pool;
pub mod worker;

pub use executor::{CommandExecutor, Directive};
pub use pool::WorkerPool;
pub use worker::{WorkerDeps, WorkerHandle, WorkerInfo, WorkerLoop};
