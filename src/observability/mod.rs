//! Observability for the AMQP worker
//!
//! Structured logging setup and the span macros used around connections and
//! consumers.

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

// Span macros for structured logging
pub use logging::{connection_span, queue_span};
