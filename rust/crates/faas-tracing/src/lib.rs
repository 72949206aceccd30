//! Traces the outbound HTTP traffic of a serverless function.
//!
//! Wrap the handler with a [`Tracer`] (or the application object with a
//! [`TracedApp`]) and construct HTTP connections through
//! [`Instrumentation::connection`]. Every request the handler sends, and the
//! response it gets back, is recorded on the invocation's trace. Tracing
//! never changes what the handler or the HTTP client sees: when anything in
//! here fails, the handler runs as if it were not traced.

pub mod client;
pub mod config;
pub mod error;
pub mod framework;
pub mod hooks;
pub mod install;
pub mod kill_switch;
pub mod lifecycle;
pub mod record;
pub mod report;
pub mod setup;
pub mod trace_context;
pub mod transport;
pub mod wire;

pub use config::TracerConfig;
pub use framework::{Framework, Handler, Registration, TracedApp};
pub use install::Instrumentation;
pub use lifecycle::{InvocationContext, InvocationMeta, Tracer};
pub use trace_context::TraceContext;

// Re-export [`tracing`] so clients don't have to add it separately.
pub use tracing;
