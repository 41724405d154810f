//! # Timeout Scheduling
//!
//! Cancellable stage timers and the low-power delivery deadline model.

pub mod deadline;
pub mod scheduler;

pub use deadline::{compute_delivery_deadline, grace_time, parse_scheduled_send_time};
pub use scheduler::{remaining_until, TimeoutHandle, TimeoutScheduler};
