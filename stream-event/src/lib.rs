//! Chat stream event protocol: type + payload + envelope.
//!
//! This crate defines the wire shape of one chat stream event and the SSE
//! envelope injection. It does not depend on marshal; the engine bridges its
//! internal progress into [`ChatEvent`] and calls [`to_sse_data`].

pub mod envelope;
pub mod event;

pub use envelope::{to_sse_data, Envelope, EnvelopeState};
pub use event::{ChatEvent, ScopeChange};
