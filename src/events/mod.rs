//! Decision events and their non-blocking fan-out.
//!
//! Every grant, deny and lifecycle change on the serving path produces
//! an [`Event`]. Events flow through the [`EventProducer`]'s bounded
//! queue to at most two [`EventSink`]s: one user listener and one
//! stats listener. Emission never blocks serving; a full queue drops
//! the event and counts the drop.

pub mod event;
pub mod producer;
pub mod sinks;

pub use event::Event;
pub use producer::EventProducer;
pub use sinks::{EventSink, LogSink, MemorySink, NullSink};
