//! The poll-and-deliver engine.
//!
//! One scheduler supervises one long-lived task per active connection; each
//! task runs worker cycles gated by a persisted circuit breaker, dispatching
//! normalized envelopes and parking failures in the durable retry queue.

pub mod batch;
pub mod breaker;
pub mod dispatcher;
pub mod scheduler;
pub mod worker;

pub use breaker::{Breaker, BreakerState};
pub use dispatcher::Dispatcher;
pub use scheduler::PollScheduler;
pub use worker::PollWorker;
