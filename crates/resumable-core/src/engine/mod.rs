//! Transfer engine
//!
//! Fetches a resource as a sequence of byte-range requests with:
//! - Durable progress (in memory or SQLite)
//! - Entity-tag checks that restart the transfer when the resource changes
//! - Retry with backoff after transient and protocol failures

mod backoff;
mod classifier;
mod content_range;
mod persistence;
mod range_request;
mod transfer_task;
mod transport;

#[cfg(test)]
mod testing;

pub use backoff::*;
pub use classifier::*;
pub use content_range::*;
pub use persistence::*;
pub use range_request::*;
pub use transfer_task::*;
pub use transport::*;
