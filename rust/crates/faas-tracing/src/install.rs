//! Installs the interception points, once per process.
//!
//! Until [`Instrumentation::install`] succeeds, every instrumented wrapper is
//! a plain pass-through. Installation is guarded by a compare-and-set, so
//! concurrent or repeated calls install exactly once; a failed installation
//! leaves the state untouched and the next invocation retries.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::client::{InstrumentedConnection, InstrumentedRequestFactory};
use crate::config::TracerConfig;
use crate::error::InstallError;
use crate::hooks::Interceptors;
use crate::trace_context::TraceContext;

const UNINSTALLED: u8 = 0;
const INSTALLING: u8 = 1;
const INSTALLED: u8 = 2;

/// What a call to [`Instrumentation::install`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Installation {
    Installed,
    AlreadyInstalled,
}

/// The instrumentation service shared by every instrumented client.
pub struct Instrumentation {
    state: AtomicU8,
    interceptors: OnceLock<Interceptors>,
    active: ActiveTrace,
}

impl Instrumentation {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINSTALLED),
            interceptors: OnceLock::new(),
            active: ActiveTrace::default(),
        }
    }

    /// The process-wide instance.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<Instrumentation>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// Activates the interception points. A no-op once installed.
    pub fn install(&self, config: &TracerConfig) -> Result<Installation, InstallError> {
        if self
            .state
            .compare_exchange(UNINSTALLED, INSTALLING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(Installation::AlreadyInstalled);
        }

        match Interceptors::new(config) {
            Ok(interceptors) => {
                tracing::debug!(
                    propagation_header = %interceptors.propagation_header(),
                    "wrapping the http client"
                );
                if self.interceptors.set(interceptors).is_err() {
                    tracing::warn!("keeping the interceptors of an earlier installation");
                }
                self.state.store(INSTALLED, Ordering::Release);
                Ok(Installation::Installed)
            }
            Err(error) => {
                self.state.store(UNINSTALLED, Ordering::Release);
                Err(error)
            }
        }
    }

    pub fn is_installed(&self) -> bool {
        self.state.load(Ordering::Acquire) == INSTALLED
    }

    /// The observation steps, once installed.
    pub fn interceptors(&self) -> Option<&Interceptors> {
        if self.is_installed() {
            self.interceptors.get()
        } else {
            None
        }
    }

    /// The trace of the invocation currently running, if any.
    pub fn active(&self) -> &ActiveTrace {
        &self.active
    }

    /// Wraps a raw connection. Construct this in place of the raw one.
    pub fn connection<C>(self: &Arc<Self>, inner: C) -> InstrumentedConnection<C> {
        InstrumentedConnection::new(inner, Arc::clone(self))
    }

    /// Wraps a raw request factory. Construct this in place of the raw one.
    pub fn request_factory<F>(self: &Arc<Self>, inner: F) -> InstrumentedRequestFactory<F> {
        InstrumentedRequestFactory::new(inner, Arc::clone(self))
    }
}

impl Default for Instrumentation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrumentation")
            .field("installed", &self.is_installed())
            .field("active", &self.active.is_active())
            .finish_non_exhaustive()
    }
}

/// Holds the trace of the running invocation, from INIT until FINALIZE.
#[derive(Default)]
pub struct ActiveTrace {
    slot: Mutex<Option<Box<dyn TraceContext>>>,
}

impl ActiveTrace {
    pub fn begin(&self, trace: Box<dyn TraceContext>) {
        if self.lock().replace(trace).is_some() {
            tracing::warn!("discarding the trace of an invocation that never finished");
        }
    }

    pub fn finish(&self) -> Option<Box<dyn TraceContext>> {
        self.lock().take()
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    /// Runs `f` against the active trace. Returns `None` when no invocation
    /// is running.
    pub fn with<T>(&self, f: impl FnOnce(&mut dyn TraceContext) -> T) -> Option<T> {
        self.lock().as_mut().map(|trace| f(trace.as_mut()))
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn TraceContext>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installs_exactly_once() {
        let instrumentation = Instrumentation::new();
        let config = TracerConfig::default();

        assert_eq!(instrumentation.install(&config).unwrap(), Installation::Installed);
        for _ in 0..3 {
            assert_eq!(
                instrumentation.install(&config).unwrap(),
                Installation::AlreadyInstalled
            );
        }
        assert!(instrumentation.is_installed());
    }

    #[test]
    fn failed_install_can_be_retried() {
        let instrumentation = Instrumentation::new();

        let error = instrumentation
            .install(&TracerConfig::default().with_propagation_header("bad header"))
            .unwrap_err();
        assert!(matches!(error, InstallError::InvalidPropagationHeader(_)));
        assert!(!instrumentation.is_installed());
        assert!(instrumentation.interceptors().is_none());

        assert_eq!(
            instrumentation.install(&TracerConfig::default()).unwrap(),
            Installation::Installed
        );
        assert!(instrumentation.interceptors().is_some());
    }

    #[test]
    fn concurrent_installs_install_once() {
        let instrumentation = Arc::new(Instrumentation::new());

        let handles = (0..8)
            .map(|_| {
                let instrumentation = Arc::clone(&instrumentation);
                std::thread::spawn(move || instrumentation.install(&TracerConfig::default()))
            })
            .collect::<Vec<_>>();
        let installed = handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap())
            .filter(|installation| *installation == Installation::Installed)
            .count();

        assert_eq!(installed, 1);
    }
}
