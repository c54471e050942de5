use std::{
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::FutureExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
    runtime::Handle,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};

use crate::{
    machine::{Phase, State, Tick},
    Callbacks, CoalescerConfig, Error, Operation, Release, Reservation, Result,
};

struct Inner<A> {
    state: State<A>,
    config: CoalescerConfig,
    poll: Option<JoinHandle<()>>,
}

struct Shared<A> {
    inner: Mutex<Inner<A>>,
    active_polls: AtomicUsize,
    runtime: Handle,
}

/// Counts a poll loop as live for as long as its future exists.
struct PollGuard<A> {
    shared: Arc<Shared<A>>,
}

impl<A> PollGuard<A> {
    fn new(shared: Arc<Shared<A>>) -> Self {
        shared.active_polls.fetch_add(1, Ordering::SeqCst);
        Self { shared }
    }
}

impl<A> Drop for PollGuard<A> {
    fn drop(&mut self) {
        self.shared.active_polls.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Collapses bursts of reservations into a single dispatched call.
///
/// Only the latest reservation survives; it is dispatched once the transport
/// is free or reported as failed once the wait budget runs out. Clones share
/// the same state, so one instance should back one group of interchangeable
/// requests.
pub struct Coalescer<A> {
    shared: Arc<Shared<A>>,
}

impl<A> Clone for Coalescer<A> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<A> fmt::Debug for Coalescer<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("Coalescer")
            .field("phase", &inner.state.phase())
            .field("in_flight", &inner.state.is_in_flight())
            .field("pending", &inner.state.is_pending())
            .field("config", &inner.config)
            .finish()
    }
}

impl<A: Clone + Send + 'static> Coalescer<A> {
    /// Create a coalescer with default configuration.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn new() -> Self {
        Self::build(CoalescerConfig::default(), Handle::current())
    }

    /// Create a coalescer from validated configuration.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn from_config(config: CoalescerConfig) -> Result<Self> {
        Self::with_handle(config, Handle::current())
    }

    /// Create a coalescer whose poll loops run on `runtime`.
    pub fn with_handle(config: CoalescerConfig, runtime: Handle) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, runtime))
    }

    fn build(config: CoalescerConfig, runtime: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: State::new(),
                    config,
                    poll: None,
                }),
                active_polls: AtomicUsize::new(0),
                runtime,
            }),
        }
    }

    /// Replace the configuration, takes effect from the next reservation.
    pub fn configure(&self, config: CoalescerConfig) -> Result<()> {
        config.validate()?;
        info!("Reconfiguring coalescer: {config:?}");
        self.shared.inner.lock().config = config;
        Ok(())
    }

    /// Reserve a call, discarding whatever was reserved before.
    ///
    /// Always returns `true`.
    pub fn reserve(&self, operation: Operation<A>, arguments: A, callbacks: Callbacks<A>) -> bool {
        let mut inner = self.shared.inner.lock();

        if inner
            .state
            .reserve(Reservation::new(operation, arguments, callbacks))
            .is_some()
        {
            debug!("Discarded pending reservation in favour of a newer one");
        }

        self.evaluate(&mut inner);
        true
    }

    /// Notify that the transport finished its previous call.
    pub fn transport_free(&self) {
        if self.shared.inner.lock().state.release() {
            debug!("Transport reported free");
        }
    }

    /// Stop polling and drop the pending reservation without calling back.
    pub fn cancel(&self) -> Option<Reservation<A>> {
        let mut inner = self.shared.inner.lock();
        if let Some(poll) = inner.poll.take() {
            poll.abort();
        }

        inner.state.cancel()
    }

    pub fn config(&self) -> CoalescerConfig {
        self.shared.inner.lock().config.clone()
    }

    pub fn phase(&self) -> Phase {
        self.shared.inner.lock().state.phase()
    }

    pub fn is_in_flight(&self) -> bool {
        self.shared.inner.lock().state.is_in_flight()
    }

    pub fn is_pending(&self) -> bool {
        self.shared.inner.lock().state.is_pending()
    }

    /// Milliseconds left before the waiting reservation fails.
    pub fn remaining_budget(&self) -> i64 {
        self.shared.inner.lock().state.remaining_budget()
    }

    /// Number of poll loops currently alive, at most one once aborted loops
    /// have been reaped by the runtime.
    pub fn active_polls(&self) -> usize {
        self.shared.active_polls.load(Ordering::SeqCst)
    }

    /// Restart the poll cycle for whatever is reserved.
    fn evaluate(&self, inner: &mut Inner<A>) {
        if let Some(poll) = inner.poll.take() {
            poll.abort();
        }

        let (generation, first_delay) = inner.state.arm(&inner.config);
        let period = inner.config.poll_interval();
        debug!("Polling transport in {first_delay:?}, then every {period:?}");

        let guard = PollGuard::new(self.shared.clone());
        inner.poll = Some(
            self.shared
                .runtime
                .spawn(poll(guard, generation, first_delay, period)),
        );
    }
}

impl<A: Clone + Send + 'static> Default for Coalescer<A> {
    fn default() -> Self {
        Self::new()
    }
}

async fn poll<A: Clone + Send + 'static>(
    guard: PollGuard<A>,
    generation: u64,
    first_delay: Duration,
    period: Duration,
) {
    let shared = guard.shared.clone();
    let period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);

    let mut interval = interval_at(Instant::now() + first_delay, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let (tick, release) = {
            let mut inner = shared.inner.lock();
            let tick = inner.state.tick(generation, period_ms);
            if !matches!(tick, Tick::Wait | Tick::Superseded) {
                inner.poll.take();
            }

            (tick, inner.config.release)
        };

        match tick {
            Tick::Wait => continue,
            Tick::Superseded => return,
            Tick::Empty => {
                debug!("{}, ending poll cycle", Error::NoReservation);
                return;
            }
            Tick::Execute {
                reservation,
                dispatch,
            } => {
                execute(&shared, reservation, dispatch, release);
                return;
            }
            Tick::Fail(reservation) => {
                fail(&shared, reservation);
                return;
            }
        }
    }
}

/// Puts the state back to rest once callbacks have run, including when one
/// of them unwinds.
struct Settle<'a, A> {
    shared: &'a Shared<A>,
    outcome: Outcome,
}

enum Outcome {
    Executed { dispatch: u64, release: Release },
    Failed,
}

impl<A> Drop for Settle<'_, A> {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        match self.outcome {
            Outcome::Executed { dispatch, release } => {
                if release == Release::Dispatch {
                    inner.state.release_dispatch(dispatch);
                }

                inner.state.finish_execution();
            }
            Outcome::Failed => inner.state.finish_failure(),
        }
    }
}

fn execute<A: Clone + Send + 'static>(
    shared: &Arc<Shared<A>>,
    reservation: Reservation<A>,
    dispatch: u64,
    release: Release,
) {
    debug!("Dispatching reservation #{dispatch}");

    let call = reservation.operation.call(reservation.arguments.clone());
    match release {
        Release::Completion => {
            let shared = shared.clone();
            shared.runtime.clone().spawn(async move {
                if AssertUnwindSafe(call).catch_unwind().await.is_err() {
                    warn!("Reservation #{dispatch} panicked while in flight");
                }

                if shared.inner.lock().state.release_dispatch(dispatch) {
                    debug!("Reservation #{dispatch} completed, transport free");
                }
            });
        }
        Release::Notify | Release::Dispatch => {
            shared.runtime.spawn(call);
        }
    }

    let _settle = Settle {
        shared,
        outcome: Outcome::Executed { dispatch, release },
    };

    reservation.notify(None);
}

fn fail<A>(shared: &Arc<Shared<A>>, reservation: Reservation<A>) {
    let error = Error::TimeoutExceeded;

    if reservation.callbacks.has_failure() {
        debug!("Reservation failed: {error}");
    } else {
        warn!("Reservation failed with no failure callback: {error}");
    }

    let _settle = Settle {
        shared,
        outcome: Outcome::Failed,
    };

    reservation.notify(Some(&error));
}
