//! karchive sink: turns resource change events into archive writes and,
//! when policy says so, deletions of the live object.

#![forbid(unsafe_code)]

mod processor;
pub mod receiver;

pub use processor::{spawn_workers, EventProcessor, Outcome, ProcessorConfig};
pub use receiver::{envelope_from_request, router, serve, EnvelopeError};
