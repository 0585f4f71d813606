//! Tracing events and debug sinks.
//!
//! The scheduler narrates each request as a stream of [`TraceEvent`]s. Events
//! flow to a [`DebugSink`] (a `tower::Service<TraceEvent>`) through a
//! bounded channel owned by the scheduler; when the consumer falls behind,
//! events are dropped rather than ever blocking request execution.

pub mod events;
pub mod sinks;

pub use events::{RecoveryKind, TraceEvent};
pub use sinks::{emit_best_effort, DebugSink, LogSink, MemorySink, NullSink};
