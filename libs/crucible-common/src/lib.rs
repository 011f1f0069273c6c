//! Shared vocabulary of the Crucible execution sandbox: job and submission
//! types, the queue/store/event traits both binaries program against, and the
//! Redis implementations of those traits.

pub mod config;
pub mod error;
pub mod events;
pub mod queue;
pub mod redis;
pub mod store;
pub mod types;
