#![doc = include_str!("../README.md")]

/// The vector clock and the `raceway-clock` causal header codec.
pub mod clock;
/// The instrumentation event record and its JSON wire representation.
pub mod event;
/// The interoperable W3C `traceparent` header codec.
pub mod traceparent;

pub use clock::{ClockPayload, ClockVector};
pub use event::{AccessType, Event, EventBatch, EventKind, EventMetadata};
pub use traceparent::Traceparent;
