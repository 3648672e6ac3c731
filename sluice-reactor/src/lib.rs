//! A single-threaded callback reactor.
//!
//! The [`Reactor`] owns three kinds of callbacks: posted callbacks which run
//! on the next turn, delayed callbacks which run once their deadline has
//! passed on the reactor's [`Clock`], and readiness callbacks which run once
//! a file descriptor becomes readable or writable. Each callback runs exactly
//! once, either with its outcome or with `ECANCELED`.
//!
//! Callbacks are queued through a [`Handle`], which can be cloned freely and
//! obtained from inside a running reactor with [`Handle::current`].
//!
//! # Modules
//! - [`park`]: the layer that blocks the thread between turns.
#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    clippy::missing_safety_doc
)]
use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use log::{trace, warn};

pub use clock::Clock;
pub use context::ContextGuard;
use park::{Park, ParkMode};
use schedule::Schedule;

mod clock;
mod context;
/// Parking abstractions and built-in park implementations.
pub mod park;
mod schedule;

const LOG: &str = "sluice_reactor";

/// Number of cancellation rounds attempted on shutdown before giving up on
/// callbacks that keep rescheduling themselves.
const SHUTDOWN_ROUNDS: usize = 16;

bitflags::bitflags! {
    /// Readiness events a callback can wait for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u8 {
        /// The descriptor can be read without blocking.
        const READABLE = 1 << 0;
        /// The descriptor can be written without blocking.
        const WRITABLE = 1 << 1;
    }
}

/// The outcome delivered to a reactor callback.
///
/// Posted and delayed callbacks receive an empty [`Interest`], readiness
/// callbacks receive the events observed. Cancelled callbacks receive an
/// `ECANCELED` error, see [`is_cancelled`].
pub type Fired = io::Result<Interest>;

/// Identifies a callback queued on a [`Reactor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    #[cfg(test)]
    pub(crate) fn from_raw(id: u64) -> Self {
        TaskId(id)
    }
}

/// Returns the error delivered to cancelled callbacks.
pub fn cancelled() -> io::Error {
    io::Error::from_raw_os_error(libc::ECANCELED)
}

/// Returns true if `err` reports a cancelled callback.
pub fn is_cancelled(err: &io::Error) -> bool {
    schedule::is_cancelled(err)
}

struct Shared {
    schedule: RefCell<Schedule>,
    clock: Clock,
}

/// A single-threaded reactor driving callbacks to completion.
///
/// [`Reactor`] is driven by calling [`Reactor::turn`], [`Reactor::run`] or
/// [`Reactor::run_until`]. Dropping the reactor cancels every callback it
/// still owns.
pub struct Reactor<P: Park> {
    shared: Rc<Shared>,
    park: P,
}

impl<P: Park> std::fmt::Debug for Reactor<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("schedule", &self.shared.schedule)
            .field("clock", &self.shared.clock)
            .finish()
    }
}

impl<P: Park> Reactor<P> {
    /// Construct a new [`Reactor`] with the given [`Park`] and [`Clock`].
    pub fn new(park: P, clock: Clock) -> Self {
        Self {
            shared: Rc::new(Shared {
                schedule: RefCell::new(Schedule::new()),
                clock,
            }),
            park,
        }
    }

    /// Returns a [`Handle`] to the [`Reactor`].
    pub fn handle(&self) -> Handle {
        Handle {
            shared: self.shared.clone(),
        }
    }

    /// Make this reactor the one returned by [`Handle::current`] until the
    /// guard is dropped.
    ///
    /// ### Panics
    /// Panics if a reactor is already entered on this thread.
    pub fn enter(&self) -> ContextGuard {
        context::Context::enter(self.handle())
    }

    /// Returns true if the reactor owns no callbacks.
    pub fn is_idle(&self) -> bool {
        self.shared.schedule.borrow().is_idle()
    }

    /// Run one turn of the reactor.
    ///
    /// Runs every callback that is ready, then parks until a timer or
    /// descriptor is ready or `max_wait` has elapsed, then runs whatever
    /// became ready. Returns the number of callbacks run.
    pub fn turn(&mut self, max_wait: Option<Duration>) -> io::Result<usize> {
        let mut ran = self.run_ready();

        let (mode, mut io) = {
            let schedule = self.shared.schedule.borrow();
            let mode = if ran > 0 || schedule.ready_len() > 0 {
                ParkMode::NoPark
            } else if let Some(deadline) = schedule.next_deadline() {
                let delta = deadline.saturating_sub(self.shared.clock.tick());
                let d = self.shared.clock.tick_to_duration(delta);
                ParkMode::Timeout(max_wait.map_or(d, |w| w.min(d)))
            } else if let Some(w) = max_wait {
                ParkMode::Timeout(w)
            } else {
                ParkMode::NextCompletion
            };
            (mode, schedule.interests())
        };

        if io.is_empty() && matches!(mode, ParkMode::NoPark | ParkMode::NextCompletion) {
            return Ok(ran);
        }
        trace!(target: LOG, "reactor.park {:?} fds={}", mode, io.len());
        self.park.park(&mut io, mode)?;
        let completed = self.shared.schedule.borrow_mut().complete_io(&io);
        if completed > 0 {
            trace!(target: LOG, "reactor.io_ready {}", completed);
        }
        ran += self.run_ready();
        Ok(ran)
    }

    /// Run the reactor until it owns no callbacks.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            let ran = self.turn(None)?;
            if ran == 0 && self.is_idle() {
                return Ok(());
            }
        }
    }

    /// Run the reactor until `cond` returns true.
    ///
    /// Returns false if `timeout` elapses first, or if the reactor runs out
    /// of callbacks that could make `cond` true.
    pub fn run_until<F>(&mut self, mut cond: F, timeout: Option<Duration>) -> io::Result<bool>
    where
        F: FnMut() -> bool,
    {
        let deadline = timeout.map(|t| self.shared.clock.now() + t);
        loop {
            if cond() {
                return Ok(true);
            }
            if self.is_idle() {
                return Ok(false);
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = self.shared.clock.now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            self.turn(wait)?;
        }
    }

    /// Cancel every callback owned by the reactor.
    ///
    /// Cancelled callbacks run before this returns. Callbacks queued after
    /// shutdown run immediately with `ECANCELED`.
    pub fn shutdown(&mut self) {
        self.shared.schedule.borrow_mut().set_shutdown();
        for _ in 0..SHUTDOWN_ROUNDS {
            let cancelled = self.shared.schedule.borrow_mut().cancel_all();
            if cancelled == 0 {
                return;
            }
            trace!(target: LOG, "reactor.shutdown cancelled={}", cancelled);
            self.run_ready();
        }
        if !self.is_idle() {
            warn!(
                target: LOG,
                "reactor.shutdown callbacks still pending {:?}", self.shared.schedule
            );
        }
    }

    fn run_ready(&mut self) -> usize {
        let now = self.shared.clock.tick();
        let n = {
            let mut schedule = self.shared.schedule.borrow_mut();
            schedule.fire_timers(now);
            schedule.ready_len()
        };
        let mut ran = 0;
        for _ in 0..n {
            // The borrow must end before the callback runs.
            let next = self.shared.schedule.borrow_mut().pop_ready();
            let Some((id, callback, fired)) = next else {
                break;
            };
            trace!(target: LOG, "reactor.run {:?}", id);
            callback(fired);
            ran += 1;
        }
        ran
    }
}

impl<P: Park> Drop for Reactor<P> {
    fn drop(&mut self) {
        self.shutdown();
        self.park.shutdown();
    }
}

/// A handle to a [`Reactor`].
///
/// Handles keep the reactor's bookkeeping alive but do not drive it.
#[derive(Clone)]
pub struct Handle {
    shared: Rc<Shared>,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("clock", &self.shared.clock)
            .finish()
    }
}

impl Handle {
    /// Returns a [`Handle`] to the reactor entered on this thread.
    ///
    /// ### Panics
    /// Panics if called outside of [`Reactor::enter`].
    #[track_caller]
    pub fn current() -> Self {
        match context::Context::handle() {
            Some(handle) => handle,
            None => panic!("not in reactor context"),
        }
    }

    /// Returns a [`Handle`] to the reactor entered on this thread, if any.
    pub fn try_current() -> Option<Self> {
        context::Context::handle()
    }

    /// Get the clock used by the reactor.
    pub fn clock(&self) -> &Clock {
        &self.shared.clock
    }

    /// Returns true once the reactor has been shut down.
    pub fn is_shutdown(&self) -> bool {
        self.shared.schedule.borrow().is_shutdown()
    }

    /// Run `f` on the next turn of the reactor.
    pub fn post<F>(&self, f: F) -> TaskId
    where
        F: FnOnce(Fired) + 'static,
    {
        let mut schedule = self.shared.schedule.borrow_mut();
        let id = schedule.next_id();
        if schedule.is_shutdown() {
            drop(schedule);
            f(Err(cancelled()));
            return id;
        }
        trace!(target: LOG, "reactor.post {:?}", id);
        schedule.push_ready(id, Box::new(f), Ok(Interest::empty()));
        id
    }

    /// Run `f` once `delay` has elapsed on the reactor's clock.
    pub fn post_after<F>(&self, delay: Duration, f: F) -> TaskId
    where
        F: FnOnce(Fired) + 'static,
    {
        let mut schedule = self.shared.schedule.borrow_mut();
        let id = schedule.next_id();
        if schedule.is_shutdown() {
            drop(schedule);
            f(Err(cancelled()));
            return id;
        }
        let clock = &self.shared.clock;
        let deadline = clock.tick().saturating_add(clock.duration_to_ticks(delay));
        trace!(target: LOG, "reactor.post_after {:?} deadline={}", id, deadline);
        schedule.insert_timer(id, deadline, Box::new(f));
        id
    }

    /// Run `f` once `fd` is ready for any of `interest`.
    ///
    /// Registrations are one-shot: register again to wait for more events.
    pub fn register<F>(&self, fd: RawFd, interest: Interest, f: F) -> TaskId
    where
        F: FnOnce(Fired) + 'static,
    {
        let mut schedule = self.shared.schedule.borrow_mut();
        let id = schedule.next_id();
        if schedule.is_shutdown() {
            drop(schedule);
            f(Err(cancelled()));
            return id;
        }
        trace!(target: LOG, "reactor.register {:?} fd={} {:?}", id, fd, interest);
        schedule.insert_io(id, fd, interest, Box::new(f));
        id
    }

    /// Cancel a queued callback.
    ///
    /// The callback still runs, on the next turn, with `ECANCELED`. Returns
    /// false if the callback is unknown or has already run.
    pub fn cancel(&self, id: TaskId) -> bool {
        let cancelled = self.shared.schedule.borrow_mut().cancel(id);
        if cancelled {
            trace!(target: LOG, "reactor.cancel {:?}", id);
        }
        cancelled
    }

    /// Run a delayed callback on the next turn instead of at its deadline.
    ///
    /// Returns false if `id` is not a pending delayed callback.
    pub fn expedite(&self, id: TaskId) -> bool {
        self.shared.schedule.borrow_mut().expedite(id)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::park::{PollPark, SimPark};
    use super::*;

    fn sim() -> (Reactor<SimPark>, Clock) {
        let clock = Clock::simulated();
        (Reactor::new(SimPark::new(clock.clone()), clock.clone()), clock)
    }

    #[test]
    fn posted_callbacks_run_in_order() {
        let (mut reactor, _) = sim();
        let handle = reactor.handle();
        let seen = Rc::new(RefCell::new(vec![]));
        for i in 0..3 {
            let seen = seen.clone();
            handle.post(move |fired| {
                assert!(fired.unwrap().is_empty());
                seen.borrow_mut().push(i);
            });
        }
        reactor.run().unwrap();
        assert_eq!(*seen.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn delayed_callback_waits_for_clock() {
        let (mut reactor, clock) = sim();
        let t0 = clock.now();
        let fired_at = Rc::new(Cell::new(None));
        {
            let fired_at = fired_at.clone();
            let clock = clock.clone();
            reactor
                .handle()
                .post_after(Duration::from_secs(2), move |_| {
                    fired_at.set(Some(clock.now()))
                });
        }
        reactor.run().unwrap();
        assert_eq!(fired_at.get().unwrap() - t0, Duration::from_secs(2));
    }

    #[test]
    fn cancel_delivers_ecanceled() {
        let (mut reactor, _) = sim();
        let handle = reactor.handle();
        let result = Rc::new(RefCell::new(None));
        let id = {
            let result = result.clone();
            handle.post_after(Duration::from_secs(60), move |fired| {
                *result.borrow_mut() = Some(fired)
            })
        };
        assert!(handle.cancel(id));
        assert!(!handle.cancel(id));
        reactor.turn(None).unwrap();
        let fired = result.borrow_mut().take().unwrap();
        assert!(is_cancelled(&fired.unwrap_err()));
        assert!(reactor.is_idle());
    }

    #[test]
    fn expedite_runs_timer_early() {
        let (mut reactor, clock) = sim();
        let t0 = clock.now();
        let handle = reactor.handle();
        let ran = Rc::new(Cell::new(false));
        let id = {
            let ran = ran.clone();
            handle.post_after(Duration::from_secs(60), move |fired| {
                assert!(fired.is_ok());
                ran.set(true)
            })
        };
        assert!(handle.expedite(id));
        reactor.turn(None).unwrap();
        assert!(ran.get());
        assert_eq!(clock.now(), t0);
    }

    #[test]
    fn run_until_reports_timeout() {
        let (mut reactor, clock) = sim();
        let t0 = clock.now();
        reactor
            .handle()
            .post_after(Duration::from_secs(10), |_| {});
        let done = reactor
            .run_until(|| false, Some(Duration::from_secs(1)))
            .unwrap();
        assert!(!done);
        assert_eq!(clock.now() - t0, Duration::from_secs(1));
    }

    #[test]
    fn readiness_callback_fires() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut reactor = Reactor::new(PollPark::new(), Clock::system());
        let ready = Rc::new(Cell::new(Interest::empty()));
        {
            let ready = ready.clone();
            reactor
                .handle()
                .register(a.as_raw_fd(), Interest::READABLE, move |fired| {
                    ready.set(fired.unwrap())
                });
        }
        b.write_all(b"ping").unwrap();
        reactor.run().unwrap();
        assert_eq!(ready.get(), Interest::READABLE);
    }

    #[test]
    fn shutdown_cancels_everything() {
        let (reactor, _) = sim();
        let handle = reactor.handle();
        let cancelled_count = Rc::new(Cell::new(0));
        for delay in [0, 5, 10] {
            let cancelled_count = cancelled_count.clone();
            handle.post_after(Duration::from_secs(delay), move |fired| {
                if matches!(&fired, Err(e) if is_cancelled(e)) {
                    cancelled_count.set(cancelled_count.get() + 1);
                }
            });
        }
        drop(reactor);
        assert_eq!(cancelled_count.get(), 3);

        let late = Rc::new(Cell::new(false));
        {
            let late = late.clone();
            handle.post(move |fired| late.set(fired.is_err()));
        }
        assert!(handle.is_shutdown());
        assert!(late.get());
    }

    #[test]
    fn current_handle_inside_enter() {
        let (reactor, _) = sim();
        assert!(Handle::try_current().is_none());
        let _g = reactor.enter();
        let handle = Handle::current();
        assert!(!handle.is_shutdown());
    }
}
