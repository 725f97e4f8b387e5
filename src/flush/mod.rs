pub mod backoff;
pub mod scheduler;

pub use backoff::{BackoffPolicy, BackoffState};
pub use scheduler::{DurableScheduler, TokioScheduler};
