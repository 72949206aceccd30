//! Instrumentation for handlers declared through a web framework.
//!
//! Wrapping the application object traces the application itself. Handlers
//! the application registers later (queue consumers, schedules, ...) are
//! separate entry points, so registrations on the allowlist have their
//! result wrapped again with the same tracer.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::config::TracerConfig;
use crate::lifecycle::{InvocationContext, InvocationMeta, Tracer};

/// Registrations that declare a new entry point of their own.
pub const HANDLER_REGISTRATIONS: &[&str] = &[
    "on_s3_event",
    "on_sns_message",
    "on_sqs_message",
    "schedule",
    "lambda_function",
];

/// Something invoked with an event and, optionally, the runtime context.
pub trait Handler<E, C> {
    type Output;
    type Error;

    fn call(&self, event: E, context: Option<C>) -> Result<Self::Output, Self::Error>;

    /// The context of the request currently being served, if the handler
    /// tracks one.
    fn current_context(&self) -> Option<C> {
        None
    }
}

/// A [`Handler`] made from a plain function. See [`handler_fn`].
#[derive(Debug, Clone, Copy)]
pub struct HandlerFn<F>(F);

pub fn handler_fn<F>(f: F) -> HandlerFn<F> {
    HandlerFn(f)
}

impl<F, E, C, O, Err> Handler<E, C> for HandlerFn<F>
where
    F: Fn(E, Option<C>) -> Result<O, Err>,
{
    type Output = O;
    type Error = Err;

    fn call(&self, event: E, context: Option<C>) -> Result<O, Err> {
        (self.0)(event, context)
    }
}

/// A named handler registration, such as `on_sqs_message("my-queue")`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub name: String,
    pub args: Vec<String>,
}

impl Registration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Whether this registration declares a new entry point.
    pub fn declares_handler(&self) -> bool {
        HANDLER_REGISTRATIONS.contains(&self.name.as_str())
    }
}

/// An application object that registers handlers by name.
pub trait Framework {
    type Handler;
    type Registered;

    fn register(&self, registration: &Registration, handler: Self::Handler) -> Self::Registered;
}

/// An application (or handler) whose invocations are traced.
///
/// Everything other than invocation and registration goes straight to the
/// wrapped value through [`Deref`].
pub struct TracedApp<T> {
    inner: T,
    tracer: Arc<Tracer>,
}

impl<T> TracedApp<T> {
    pub fn new(inner: T, config: TracerConfig) -> Self {
        Self::with_tracer(inner, Arc::new(Tracer::new(config)))
    }

    pub fn with_tracer(inner: T, tracer: Arc<Tracer>) -> Self {
        Self { inner, tracer }
    }

    pub fn tracer(&self) -> &Arc<Tracer> {
        &self.tracer
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Framework> TracedApp<T> {
    /// Registers `handler` with the wrapped application. When running in the
    /// serverless runtime, handlers declared by an allowlisted registration
    /// come back traced.
    pub fn register(
        &self,
        registration: &Registration,
        handler: T::Handler,
    ) -> Registered<T::Registered> {
        let registered = self.inner.register(registration, handler);
        if self.tracer.config().aws_environment && registration.declares_handler() {
            tracing::debug!(registration = %registration.name, "tracing registered handler");
            Registered::Traced(TracedApp::with_tracer(registered, Arc::clone(&self.tracer)))
        } else {
            Registered::Plain(registered)
        }
    }
}

impl<T> Deref for TracedApp<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: fmt::Debug> fmt::Debug for TracedApp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracedApp")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl<T, E, C> Handler<E, C> for TracedApp<T>
where
    T: Handler<E, C>,
    T::Output: fmt::Debug,
    T::Error: fmt::Display,
    C: InvocationContext,
{
    type Output = T::Output;
    type Error = T::Error;

    fn call(&self, event: E, context: Option<C>) -> Result<T::Output, T::Error> {
        let context = context.or_else(|| self.inner.current_context());
        let meta = InvocationMeta::from_context(context.as_ref());
        self.tracer.invoke(&meta, || self.inner.call(event, context))
    }

    fn current_context(&self) -> Option<C> {
        self.inner.current_context()
    }
}

/// The result of [`TracedApp::register`].
#[derive(Debug)]
pub enum Registered<R> {
    Traced(TracedApp<R>),
    Plain(R),
}

impl<R> Registered<R> {
    pub fn is_traced(&self) -> bool {
        matches!(self, Self::Traced(_))
    }

    pub fn into_inner(self) -> R {
        match self {
            Self::Traced(app) => app.into_inner(),
            Self::Plain(inner) => inner,
        }
    }
}

impl<R> Deref for Registered<R> {
    type Target = R;

    fn deref(&self) -> &R {
        match self {
            Self::Traced(app) => app,
            Self::Plain(inner) => inner,
        }
    }
}

impl<R, E, C> Handler<E, C> for Registered<R>
where
    R: Handler<E, C>,
    R::Output: fmt::Debug,
    R::Error: fmt::Display,
    C: InvocationContext,
{
    type Output = R::Output;
    type Error = R::Error;

    fn call(&self, event: E, context: Option<C>) -> Result<R::Output, R::Error> {
        match self {
            Self::Traced(app) => app.call(event, context),
            Self::Plain(inner) => inner.call(event, context),
        }
    }

    fn current_context(&self) -> Option<C> {
        match self {
            Self::Traced(app) => app.current_context(),
            Self::Plain(inner) => inner.current_context(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::install::Instrumentation;
    use crate::report::Reporter;
    use crate::trace_context::{InvocationTrace, InvocationTraceFactory};

    #[derive(Debug, Clone, PartialEq)]
    struct Context(&'static str);

    impl InvocationContext for Context {
        fn request_id(&self) -> Option<&str> {
            Some(self.0)
        }
    }

    type Route = fn(String, Option<Context>) -> Result<String, String>;

    #[derive(Debug, Default)]
    struct App {
        registrations: Mutex<Vec<String>>,
    }

    impl Handler<String, Context> for App {
        type Output = String;
        type Error = String;

        fn call(&self, event: String, _context: Option<Context>) -> Result<String, String> {
            Ok(format!("app: {event}"))
        }

        fn current_context(&self) -> Option<Context> {
            Some(Context("current-request"))
        }
    }

    impl Framework for App {
        type Handler = Route;
        type Registered = HandlerFn<Route>;

        fn register(&self, registration: &Registration, handler: Route) -> HandlerFn<Route> {
            self.registrations
                .lock()
                .unwrap()
                .push(registration.name.clone());
            handler_fn(handler)
        }
    }

    #[derive(Debug, Clone, Default)]
    struct Recorded(Arc<Mutex<Vec<InvocationTrace>>>);

    impl Reporter for Recorded {
        fn report(&self, trace: &InvocationTrace) {
            self.0.lock().unwrap().push(trace.clone());
        }
    }

    impl Recorded {
        fn request_ids(&self) -> Vec<Option<String>> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .map(|trace| trace.request_id().map(str::to_owned))
                .collect()
        }
    }

    fn traced(aws_environment: bool) -> (TracedApp<App>, Recorded) {
        let recorded = Recorded::default();
        let tracer = Tracer::new(TracerConfig::default().with_aws_environment(aws_environment))
            .with_instrumentation(Arc::new(Instrumentation::new()))
            .with_trace_factory(InvocationTraceFactory::with_reporter(recorded.clone()));
        (TracedApp::with_tracer(App::default(), Arc::new(tracer)), recorded)
    }

    fn echo(event: String, context: Option<Context>) -> Result<String, String> {
        Ok(format!("{event} ({})", context.map_or("none", |context| context.0)))
    }

    #[test]
    fn defaults_the_context_to_the_current_request() {
        let (app, recorded) = traced(true);

        assert_eq!(app.call("ping".to_owned(), None::<Context>).unwrap(), "app: ping");
        app.call("ping".to_owned(), Some(Context("explicit"))).unwrap();

        assert_eq!(
            recorded.request_ids(),
            vec![
                Some("current-request".to_owned()),
                Some("explicit".to_owned())
            ]
        );
    }

    #[test]
    fn rewraps_allowlisted_registrations() {
        let (app, recorded) = traced(true);

        let consumer = app.register(&Registration::new("on_sqs_message").with_arg("queue"), echo);
        assert!(consumer.is_traced());
        assert_eq!(
            consumer.call("msg".to_owned(), Some(Context("sqs"))).unwrap(),
            "msg (sqs)"
        );
        assert_eq!(recorded.request_ids(), vec![Some("sqs".to_owned())]);

        let route = app.register(&Registration::new("route").with_arg("/"), echo);
        assert!(!route.is_traced());
        route.call("get".to_owned(), None::<Context>).unwrap();
        assert_eq!(recorded.request_ids().len(), 1);

        assert_eq!(
            *app.registrations.lock().unwrap(),
            vec!["on_sqs_message".to_owned(), "route".to_owned()]
        );
    }

    #[test]
    fn leaves_registrations_alone_outside_the_runtime() {
        let (app, _) = traced(false);

        for name in HANDLER_REGISTRATIONS {
            assert!(!app.register(&Registration::new(*name), echo).is_traced());
        }
    }
}
