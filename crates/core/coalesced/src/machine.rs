//! Timer-free core of the coalescer.
//!
//! [`State`] holds everything one coalescer instance knows and [`State::tick`]
//! is the transition run on every poll. The tokio driver in
//! [`crate::Coalescer`] only decides *when* to call it; hosts with their own
//! event loop can drive a `State` directly.

use std::time::Duration;

use crate::{CoalescerConfig, Reservation};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
/// Where the current cycle stands.
pub enum Phase {
    /// No reservation and no poll loop
    Idle,
    /// A reservation is waiting for the transport
    Waiting,
    /// A reservation was taken for dispatch and its callbacks are running
    Executing,
    /// A reservation timed out and its failure callback is running
    Failed,
}

#[derive(Debug)]
/// Outcome of a single poll.
pub enum Tick<A> {
    /// Transport is busy, poll again later
    Wait,
    /// Transport is free, dispatch this reservation
    Execute {
        reservation: Reservation<A>,
        dispatch: u64,
    },
    /// Budget exhausted, report this reservation as failed
    Fail(Reservation<A>),
    /// Nothing was reserved, the cycle ends
    Empty,
    /// The poll belongs to a cycle that was cancelled or restarted
    Superseded,
}

#[derive(Debug)]
pub struct State<A> {
    in_flight: bool,
    reservation: Option<Reservation<A>>,
    remaining_ms: i64,
    failed: bool,
    executing: bool,
    polling: bool,
    generation: u64,
    dispatch: u64,
}

impl<A> Default for State<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> State<A> {
    pub fn new() -> Self {
        Self {
            in_flight: false,
            reservation: None,
            remaining_ms: 0,
            failed: false,
            executing: false,
            polling: false,
            generation: 0,
            dispatch: 0,
        }
    }

    /// Store a reservation, returning the one it replaced.
    pub fn reserve(&mut self, reservation: Reservation<A>) -> Option<Reservation<A>> {
        self.reservation.replace(reservation)
    }

    /// Start a new poll cycle, superseding any running one.
    ///
    /// Returns the generation that ticks of this cycle must present and the
    /// delay before the first tick.
    pub fn arm(&mut self, config: &CoalescerConfig) -> (u64, Duration) {
        self.generation = self.generation.wrapping_add(1);
        self.polling = true;
        self.remaining_ms = i64::try_from(config.timeout_budget_ms).unwrap_or(i64::MAX);

        (self.generation, config.first_delay(!self.in_flight))
    }

    /// Stop the running poll cycle, if any.
    pub fn disarm(&mut self) {
        if self.polling {
            self.polling = false;
            self.generation = self.generation.wrapping_add(1);
        }
    }

    /// Run one poll of the cycle identified by `generation`.
    pub fn tick(&mut self, generation: u64, poll_interval_ms: u64) -> Tick<A> {
        if !self.polling || generation != self.generation {
            return Tick::Superseded;
        }

        let step = i64::try_from(poll_interval_ms).unwrap_or(i64::MAX);
        self.remaining_ms = self.remaining_ms.saturating_sub(step);

        let Some(reservation) = self.reservation.take() else {
            self.polling = false;
            return Tick::Empty;
        };

        if self.remaining_ms <= 0 {
            self.polling = false;
            self.failed = true;
            Tick::Fail(reservation)
        } else if !self.in_flight {
            self.polling = false;
            self.in_flight = true;
            self.executing = true;
            self.dispatch = self.dispatch.wrapping_add(1);
            Tick::Execute {
                reservation,
                dispatch: self.dispatch,
            }
        } else {
            self.reservation = Some(reservation);
            Tick::Wait
        }
    }

    /// Callbacks of an executed reservation have run.
    pub fn finish_execution(&mut self) {
        self.executing = false;
    }

    /// Failure callback has run, consume the failure flag.
    pub fn finish_failure(&mut self) {
        self.failed = false;
    }

    /// Transport reported it is free again. Returns whether it was busy.
    pub fn release(&mut self) -> bool {
        std::mem::replace(&mut self.in_flight, false)
    }

    /// Release the transport only if `dispatch` is still the latest call.
    pub fn release_dispatch(&mut self, dispatch: u64) -> bool {
        if self.dispatch == dispatch {
            self.release()
        } else {
            false
        }
    }

    /// Stop polling and discard the pending reservation without reporting it.
    pub fn cancel(&mut self) -> Option<Reservation<A>> {
        self.disarm();
        self.reservation.take()
    }

    pub fn phase(&self) -> Phase {
        if self.failed {
            Phase::Failed
        } else if self.executing {
            Phase::Executing
        } else if self.polling {
            Phase::Waiting
        } else {
            Phase::Idle
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }

    pub fn is_pending(&self) -> bool {
        self.reservation.is_some()
    }

    pub fn remaining_budget(&self) -> i64 {
        self.remaining_ms
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}
