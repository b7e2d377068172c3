#![doc = include_str!("../README.md")]

pub mod envelope;
mod forwarder;
pub mod outbox;
pub mod queue;

#[doc(inline)]
pub use envelope::{Envelope, MessageState};

#[doc(inline)]
pub use queue::{Queue, QueueError, QueueErrorKind};

#[doc(inline)]
pub use outbox::{Outbox, OutboxError, OutboxErrorKind};

#[doc(inline)]
pub use forwarder::{
    DefaultForwarderHook, Forwarder, ForwarderHook, ForwarderRunError, ForwarderRunErrorKind,
};
