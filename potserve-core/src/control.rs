// MIT License
// Copyright 2023--present potserve developers

//! Reload and shutdown control.
//!
//! A single operator interrupt means "reload the potential"; a second one
//! arriving within the debounce window of the first means "shut down".
//! The state lives in a [`ControlHandle`] owned by one server instance and
//! cloned into whatever produces interrupts: the Ctrl-C forwarder spawned by
//! [`spawn_interrupt_listener`], a test, or an embedding application.
//!
//! ```text
//! Idle --interrupt--> ReloadPending --take_reload--> Idle
//! Idle --interrupt within window--> ShutdownPending --> Terminated
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ReloadError;
use crate::potential::SharedPotential;
use crate::registry::HandlerSource;

/// Default debounce window between interrupts.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_secs(2);

/// Outcome of one interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Reload,
    Shutdown,
}

struct ControlState {
    listening: AtomicBool,
    reload_requested: AtomicBool,
    shutdown: CancellationToken,
    last_interrupt: Mutex<Option<Instant>>,
    debounce_window: Duration,
}

/// Cloneable handle on a server's control state.
#[derive(Clone)]
pub struct ControlHandle {
    inner: Arc<ControlState>,
}

impl ControlHandle {
    pub fn new(debounce_window: Duration) -> Self {
        Self {
            inner: Arc::new(ControlState {
                listening: AtomicBool::new(false),
                reload_requested: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                last_interrupt: Mutex::new(None),
                debounce_window,
            }),
        }
    }

    pub fn debounce_window(&self) -> Duration {
        self.inner.debounce_window
    }

    /// Record an interrupt arriving now.
    pub fn interrupt(&self) -> ControlEvent {
        self.interrupt_at(Instant::now())
    }

    /// Record an interrupt arriving at `now`.
    ///
    /// Escalates to shutdown when the previous interrupt is no more than the
    /// debounce window ago. The timestamp is updated either way.
    pub fn interrupt_at(&self, now: Instant) -> ControlEvent {
        let mut last = self.inner.last_interrupt.lock();
        let within_window = last
            .map(|prev| now.saturating_duration_since(prev) <= self.inner.debounce_window)
            .unwrap_or(false);
        *last = Some(now);
        drop(last);

        if within_window {
            self.inner.reload_requested.store(false, Ordering::SeqCst);
            self.inner.shutdown.cancel();
            ControlEvent::Shutdown
        } else {
            self.inner.reload_requested.store(true, Ordering::SeqCst);
            ControlEvent::Reload
        }
    }

    pub fn request_reload(&self) {
        self.inner.reload_requested.store(true, Ordering::SeqCst);
    }

    /// Ask the accept loop to exit once the current connection is done.
    pub fn request_shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_reload_requested(&self) -> bool {
        self.inner.reload_requested.load(Ordering::SeqCst)
    }

    /// Clear a pending reload, returning whether one was pending.
    pub fn take_reload(&self) -> bool {
        self.inner.reload_requested.swap(false, Ordering::SeqCst)
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Resolves once shutdown has been requested.
    pub async fn shutdown_requested(&self) {
        self.inner.shutdown.cancelled().await
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst)
    }

    pub(crate) fn set_listening(&self, listening: bool) {
        self.inner.listening.store(listening, Ordering::SeqCst);
    }
}

impl Default for ControlHandle {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_WINDOW)
    }
}

impl std::fmt::Debug for ControlHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlHandle")
            .field("listening", &self.is_listening())
            .field("reload_requested", &self.is_reload_requested())
            .field("shutdown_requested", &self.is_shutdown_requested())
            .field("debounce_window", &self.inner.debounce_window)
            .finish()
    }
}

/// The handler currently answering requests, plus where to reload it from.
pub struct ActiveHandler {
    current: SharedPotential,
    source: Option<Arc<dyn HandlerSource>>,
}

impl ActiveHandler {
    /// A fixed handler; reload requests are ignored with a warning.
    pub fn new(handler: SharedPotential) -> Self {
        Self {
            current: handler,
            source: None,
        }
    }

    pub fn with_source(handler: SharedPotential, source: Arc<dyn HandlerSource>) -> Self {
        Self {
            current: handler,
            source: Some(source),
        }
    }

    /// Resolve `source` once to get the initial handler.
    pub fn load(source: Arc<dyn HandlerSource>) -> Result<Self, ReloadError> {
        let handler = source.load()?;
        info!(handler = handler.name(), source = %source.describe(), "potential loaded");
        Ok(Self::with_source(handler, source))
    }

    /// The handler to use for the next request.
    pub fn current(&self) -> SharedPotential {
        Arc::clone(&self.current)
    }

    pub fn source(&self) -> Option<&Arc<dyn HandlerSource>> {
        self.source.as_ref()
    }

    /// Re-resolve the source and swap in the result.
    ///
    /// Returns whether the handler was replaced. On any failure the previous
    /// handler stays active.
    pub fn apply_reload(&mut self) -> bool {
        let Some(source) = self.source.as_ref() else {
            warn!("reload requested but no potential source is configured");
            return false;
        };
        match source.load() {
            Ok(handler) => {
                info!(handler = handler.name(), source = %source.describe(), "potential reloaded");
                self.current = handler;
                true
            }
            Err(e) => {
                error!(source = %source.describe(), "reload failed, keeping previous potential: {e}");
                false
            }
        }
    }

    /// Apply a reload if `control` has one pending.
    pub fn apply_pending(&mut self, control: &ControlHandle) -> bool {
        control.take_reload() && self.apply_reload()
    }
}

/// Ctrl-C forwarding for one serving session.
///
/// While any forwarder is alive SIGINT is routed into its
/// [`ControlHandle`]. Once the last one is dropped, SIGINT terminates the
/// process again as if no handler had ever been installed.
pub struct InterruptForwarder {
    task: tokio::task::JoinHandle<()>,
    _default: sigint::Suspended,
}

impl Drop for InterruptForwarder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Forward Ctrl-C (SIGINT) into `control` until shutdown is requested or
/// the returned forwarder is dropped.
///
/// Must be called from within a tokio runtime.
pub fn spawn_interrupt_listener(control: ControlHandle) -> std::io::Result<InterruptForwarder> {
    let suspended = sigint::Suspended::acquire()?;
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = control.shutdown_requested() => break,
                res = tokio::signal::ctrl_c() => {
                    if let Err(e) = res {
                        warn!("cannot listen for interrupts: {e}");
                        break;
                    }
                    match control.interrupt() {
                        ControlEvent::Reload => info!(
                            "interrupt received, reloading potential (interrupt again within {:?} to shut down)",
                            control.debounce_window()
                        ),
                        ControlEvent::Shutdown => {
                            info!("second interrupt received, shutting down");
                            break;
                        }
                    }
                }
            }
        }
    });
    Ok(InterruptForwarder {
        task,
        _default: suspended,
    })
}

/// The default SIGINT action, suspended while forwarders are alive.
///
/// tokio's SIGINT handler stays installed for the life of the process. A
/// second hook registered beside it runs the default action whenever the
/// forwarder count is zero.
#[cfg(unix)]
mod sigint {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use parking_lot::{const_mutex, Mutex};
    use signal_hook::consts::SIGINT;

    struct Registration {
        restore_default: Arc<AtomicBool>,
        forwarders: usize,
    }

    static REGISTRATION: Mutex<Option<Registration>> = const_mutex(None);

    pub(super) struct Suspended(());

    impl Suspended {
        pub(super) fn acquire() -> std::io::Result<Self> {
            let mut slot = REGISTRATION.lock();
            let mut registration = match slot.take() {
                Some(registration) => registration,
                None => {
                    let restore_default = Arc::new(AtomicBool::new(false));
                    signal_hook::flag::register_conditional_default(SIGINT, Arc::clone(&restore_default))?;
                    Registration {
                        restore_default,
                        forwarders: 0,
                    }
                }
            };
            registration.forwarders += 1;
            registration.restore_default.store(false, Ordering::SeqCst);
            *slot = Some(registration);
            Ok(Suspended(()))
        }
    }

    impl Drop for Suspended {
        fn drop(&mut self) {
            if let Some(registration) = REGISTRATION.lock().as_mut() {
                registration.forwarders = registration.forwarders.saturating_sub(1);
                if registration.forwarders == 0 {
                    registration.restore_default.store(true, Ordering::SeqCst);
                }
            }
        }
    }
}

#[cfg(not(unix))]
mod sigint {
    pub(super) struct Suspended(());

    impl Suspended {
        pub(super) fn acquire() -> std::io::Result<Self> {
            Ok(Suspended(()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::potential::{Evaluation, FnPotential, ForceInput};
    use crate::registry::FnSource;

    #[test]
    fn single_interrupt_requests_reload() {
        let control = ControlHandle::default();
        assert_eq!(control.interrupt(), ControlEvent::Reload);
        assert!(control.is_reload_requested());
        assert!(!control.is_shutdown_requested());
        assert!(control.take_reload());
        assert!(!control.take_reload());
    }

    #[test]
    fn second_interrupt_within_window_shuts_down() {
        let control = ControlHandle::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert_eq!(control.interrupt_at(t0), ControlEvent::Reload);
        assert_eq!(
            control.interrupt_at(t0 + Duration::from_millis(500)),
            ControlEvent::Shutdown
        );
        assert!(control.is_shutdown_requested());
        assert!(!control.is_reload_requested());
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let control = ControlHandle::new(Duration::from_secs(2));
        let t0 = Instant::now();
        control.interrupt_at(t0);
        assert_eq!(
            control.interrupt_at(t0 + Duration::from_secs(2)),
            ControlEvent::Shutdown
        );
    }

    #[test]
    fn interrupt_after_window_rearms_reload() {
        let control = ControlHandle::new(Duration::from_secs(2));
        let t0 = Instant::now();
        control.interrupt_at(t0);
        assert!(control.take_reload());

        let t1 = t0 + Duration::from_secs(3);
        assert_eq!(control.interrupt_at(t1), ControlEvent::Reload);
        assert!(control.is_reload_requested());
        assert!(!control.is_shutdown_requested());

        // The window is measured from the most recent interrupt.
        assert_eq!(
            control.interrupt_at(t1 + Duration::from_secs(1)),
            ControlEvent::Shutdown
        );
    }

    #[test]
    fn clones_share_state() {
        let control = ControlHandle::default();
        let other = control.clone();
        other.request_shutdown();
        assert!(control.is_shutdown_requested());
        other.set_listening(true);
        assert!(control.is_listening());
    }

    fn constant(name: &'static str, energy: f64) -> SharedPotential {
        Arc::new(FnPotential::new(name, move |input: &ForceInput<'_>| {
            Ok(Evaluation {
                energy,
                forces: vec![[0.0; 3]; input.n_atoms()],
            })
        }))
    }

    #[test]
    fn reload_without_source_keeps_handler() {
        let mut active = ActiveHandler::new(constant("fixed", 1.0));
        assert!(!active.apply_reload());
        assert_eq!(active.current().name(), "fixed");
    }

    #[test]
    fn successful_reload_swaps_handler() {
        let source = Arc::new(FnSource::new("inline", || Ok(constant("fresh", 2.0))));
        let mut active = ActiveHandler::with_source(constant("stale", 1.0), source);
        let in_flight = active.current();
        assert!(active.apply_reload());
        assert_eq!(active.current().name(), "fresh");
        // A clone taken before the swap still answers with the old handler.
        assert_eq!(in_flight.name(), "stale");
    }

    #[test]
    fn failed_reload_keeps_previous_handler() {
        let source = Arc::new(FnSource::new("broken", || {
            Err(ReloadError::UnknownPotential("missing".into()))
        }));
        let mut active = ActiveHandler::with_source(constant("working", 1.0), source);
        assert!(!active.apply_reload());
        assert_eq!(active.current().name(), "working");
    }

    #[test]
    fn pending_reload_is_consumed_once() {
        let source = Arc::new(FnSource::new("inline", || Ok(constant("fresh", 2.0))));
        let mut active = ActiveHandler::with_source(constant("stale", 1.0), source);
        let control = ControlHandle::default();
        assert!(!active.apply_pending(&control));

        control.request_reload();
        assert!(active.apply_pending(&control));
        assert!(!control.is_reload_requested());
        assert!(!active.apply_pending(&control));
    }

    #[test]
    fn initial_load_propagates_errors() {
        let source = Arc::new(FnSource::new("broken", || Err(ReloadError::NoSource)));
        assert!(ActiveHandler::load(source).is_err());
    }

    #[tokio::test]
    async fn shutdown_future_resolves_after_request() {
        let control = ControlHandle::default();
        let waiter = control.clone();
        let task = tokio::spawn(async move { waiter.shutdown_requested().await });
        control.request_shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
