//! The fail-open lifecycle around one function invocation.
//!
//! ```text
//! kill switch? ── yes ──> run the handler untouched
//!      │ no
//!   INIT (create and start the trace) ─┐
//!   INSTALL (once per process)         ├─ failure or panic ──> run the handler untraced
//!      │                               ┘
//!   RUN ──> SUCCESS / EXCEPTION ──> FINALIZE ──> the handler's own outcome
//! ```
//!
//! Once the handler has started, its outcome always wins: the value it
//! returns, the error it returns, or the panic it raises reaches the caller
//! unchanged.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::span::EnteredSpan;

use crate::config::TracerConfig;
use crate::error::LifecycleError;
use crate::install::Instrumentation;
use crate::kill_switch;
use crate::record::Outcome;
use crate::report::OtelReporter;
use crate::trace_context::{InvocationTraceFactory, TraceFactory};

/// What the tracer knows about an invocation before it runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationMeta {
    pub request_id: Option<String>,
}

impl InvocationMeta {
    pub fn with_request_id(request_id: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
        }
    }

    pub fn from_context<C: InvocationContext>(context: Option<&C>) -> Self {
        Self {
            request_id: context
                .and_then(|context| context.request_id())
                .map(str::to_owned),
        }
    }
}

/// The runtime context handed to a handler alongside its event.
pub trait InvocationContext {
    fn request_id(&self) -> Option<&str>;
}

/// Runs handlers inside a traced invocation.
pub struct Tracer {
    config: TracerConfig,
    instrumentation: Arc<Instrumentation>,
    factory: Box<dyn TraceFactory>,
}

impl Tracer {
    /// A tracer bound to the process-wide instrumentation, reporting through
    /// the global OpenTelemetry tracer provider.
    pub fn new(config: TracerConfig) -> Self {
        Self {
            config,
            instrumentation: Instrumentation::global(),
            factory: Box::new(InvocationTraceFactory::with_reporter(OtelReporter::global())),
        }
    }

    pub fn with_instrumentation(self, instrumentation: Arc<Instrumentation>) -> Self {
        Self {
            instrumentation,
            ..self
        }
    }

    pub fn with_trace_factory(self, factory: impl TraceFactory + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            ..self
        }
    }

    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    pub fn instrumentation(&self) -> &Arc<Instrumentation> {
        &self.instrumentation
    }

    /// Whether tracing is off for the next invocation, either by
    /// configuration or by the kill-switch variable.
    pub fn is_switched_off(&self) -> bool {
        self.config.switch_off || kill_switch::is_active()
    }

    /// Runs `handler` as one traced invocation and returns its result
    /// unchanged.
    pub fn invoke<R, E, H>(&self, meta: &InvocationMeta, handler: H) -> Result<R, E>
    where
        H: FnOnce() -> Result<R, E>,
        R: fmt::Debug,
        E: fmt::Display,
    {
        if self.is_switched_off() {
            return handler();
        }
        if let Err(error) = self.prepare(meta) {
            tracing::error!(%error, "exception in the wrapper, running the handler untraced");
            return handler();
        }
        self.run(meta, handler)
    }

    /// INIT and INSTALL. Installation failures are logged here and never
    /// abort the invocation; only a trace that cannot be created does.
    fn prepare(&self, meta: &InvocationMeta) -> Result<(), LifecycleError> {
        panic::catch_unwind(AssertUnwindSafe(|| -> Result<(), LifecycleError> {
            let mut trace = self.factory.create(meta)?;
            trace.start();
            self.instrumentation.active().begin(trace);

            if let Err(error) = self.instrumentation.install(&self.config) {
                tracing::error!(%error, "failed to wrap the http client");
            }
            Ok(())
        }))
        .unwrap_or_else(|payload| {
            self.instrumentation.active().finish();
            Err(LifecycleError::Panicked(panic_message(payload.as_ref())))
        })
    }

    fn run<R, E, H>(&self, meta: &InvocationMeta, handler: H) -> Result<R, E>
    where
        H: FnOnce() -> Result<R, E>,
        R: fmt::Debug,
        E: fmt::Display,
    {
        let scope = self.config.request_id_logging.then(|| {
            tracing::info_span!(
                "invocation",
                request_id = meta.request_id.as_deref().unwrap_or_default()
            )
            .entered()
        });

        match panic::catch_unwind(AssertUnwindSafe(handler)) {
            Ok(Ok(value)) => {
                self.finalize(scope, Outcome::Returned(format!("{value:?}")));
                Ok(value)
            }
            Ok(Err(error)) => {
                self.instrumentation
                    .active()
                    .with(|trace| trace.add_exception_event(&error));
                self.finalize(scope, Outcome::Raised(error.to_string()));
                Err(error)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                self.instrumentation
                    .active()
                    .with(|trace| trace.add_exception_event(&message));
                self.finalize(scope, Outcome::Raised(message));
                panic::resume_unwind(payload)
            }
        }
    }

    /// Ends the trace, then leaves the request-id log scope. A trace that
    /// panics while ending is logged and dropped.
    fn finalize(&self, scope: Option<EnteredSpan>, outcome: Outcome) {
        if let Some(mut trace) = self.instrumentation.active().finish() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| trace.end(outcome))) {
                tracing::error!(
                    error = %panic_message(payload.as_ref()),
                    "failed to end the invocation trace"
                );
            }
        }
        drop(scope);
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("config", &self.config)
            .field("instrumentation", &self.instrumentation)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_owned())
}
