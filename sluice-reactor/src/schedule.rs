//! Bookkeeping for callbacks owned by a reactor.
//!
//! Every callback lives in exactly one place: the ready queue, the timer
//! map, or the readiness registrations. Moving an entry between places
//! never runs it; only the reactor runs callbacks, and never while the
//! schedule is borrowed.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;

use smallvec::SmallVec;

use crate::park::Readiness;
use crate::{cancelled, Fired, Interest, TaskId};

pub(crate) type Callback = Box<dyn FnOnce(Fired)>;

struct Registration {
    id: TaskId,
    fd: RawFd,
    interest: Interest,
    callback: Callback,
}

pub(crate) struct Schedule {
    next_id: u64,
    ready: VecDeque<(TaskId, Callback, Fired)>,
    timers: BTreeMap<(u64, TaskId), Callback>,
    deadlines: HashMap<TaskId, u64>,
    io: Vec<Registration>,
    shutdown: bool,
}

impl Schedule {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            ready: VecDeque::new(),
            timers: BTreeMap::new(),
            deadlines: HashMap::new(),
            io: Vec::new(),
            shutdown: false,
        }
    }

    pub(crate) fn next_id(&mut self) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub(crate) fn set_shutdown(&mut self) {
        self.shutdown = true;
    }

    pub(crate) fn push_ready(&mut self, id: TaskId, callback: Callback, fired: Fired) {
        self.ready.push_back((id, callback, fired));
    }

    pub(crate) fn pop_ready(&mut self) -> Option<(TaskId, Callback, Fired)> {
        self.ready.pop_front()
    }

    pub(crate) fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub(crate) fn insert_timer(&mut self, id: TaskId, deadline: u64, callback: Callback) {
        self.timers.insert((deadline, id), callback);
        self.deadlines.insert(id, deadline);
    }

    pub(crate) fn insert_io(
        &mut self,
        id: TaskId,
        fd: RawFd,
        interest: Interest,
        callback: Callback,
    ) {
        self.io.push(Registration {
            id,
            fd,
            interest,
            callback,
        });
    }

    /// Replace the outcome of a pending callback with `ECANCELED`.
    ///
    /// Returns false if `id` is unknown or has already run.
    pub(crate) fn cancel(&mut self, id: TaskId) -> bool {
        if let Some(entry) = self.ready.iter_mut().find(|(i, _, _)| *i == id) {
            entry.2 = Err(cancelled());
            return true;
        }
        if let Some(callback) = self.remove_timer(id) {
            self.push_ready(id, callback, Err(cancelled()));
            return true;
        }
        if let Some(pos) = self.io.iter().position(|r| r.id == id) {
            let reg = self.io.swap_remove(pos);
            self.push_ready(id, reg.callback, Err(cancelled()));
            return true;
        }
        false
    }

    /// Move a pending timer to the ready queue ahead of its deadline.
    pub(crate) fn expedite(&mut self, id: TaskId) -> bool {
        match self.remove_timer(id) {
            Some(callback) => {
                self.push_ready(id, callback, Ok(Interest::empty()));
                true
            }
            None => false,
        }
    }

    fn remove_timer(&mut self, id: TaskId) -> Option<Callback> {
        let deadline = self.deadlines.remove(&id)?;
        self.timers.remove(&(deadline, id))
    }

    /// Move every timer whose deadline is at or before `now` to the ready queue.
    pub(crate) fn fire_timers(&mut self, now: u64) -> usize {
        let mut fired = 0;
        while let Some(entry) = self.timers.first_entry() {
            let (deadline, id) = *entry.key();
            if deadline > now {
                break;
            }
            let callback = entry.remove();
            self.deadlines.remove(&id);
            self.push_ready(id, callback, Ok(Interest::empty()));
            fired += 1;
        }
        fired
    }

    pub(crate) fn next_deadline(&self) -> Option<u64> {
        self.timers.keys().next().map(|(deadline, _)| *deadline)
    }

    pub(crate) fn interests(&self) -> SmallVec<[Readiness; 8]> {
        self.io
            .iter()
            .map(|r| Readiness::new(r.id, r.fd, r.interest))
            .collect()
    }

    /// Move registrations observed ready by the park layer to the ready queue.
    pub(crate) fn complete_io(&mut self, observed: &[Readiness]) -> usize {
        let mut completed = 0;
        for r in observed.iter().filter(|r| !r.ready().is_empty()) {
            if let Some(pos) = self.io.iter().position(|reg| reg.id == r.id()) {
                let reg = self.io.swap_remove(pos);
                self.push_ready(reg.id, reg.callback, Ok(r.ready()));
                completed += 1;
            }
        }
        completed
    }

    pub(crate) fn has_pending_io(&self) -> bool {
        !self.io.is_empty()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.timers.is_empty() && self.io.is_empty()
    }

    /// Cancel everything still owned by the schedule.
    pub(crate) fn cancel_all(&mut self) -> usize {
        let mut n = 0;
        for entry in self.ready.iter_mut() {
            entry.2 = Err(cancelled());
            n += 1;
        }
        let timers = std::mem::take(&mut self.timers);
        self.deadlines.clear();
        for ((_, id), callback) in timers {
            self.push_ready(id, callback, Err(cancelled()));
            n += 1;
        }
        for reg in std::mem::take(&mut self.io) {
            self.push_ready(reg.id, reg.callback, Err(cancelled()));
            n += 1;
        }
        n
    }
}

impl std::fmt::Debug for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schedule")
            .field("ready", &self.ready.len())
            .field("timers", &self.timers.len())
            .field("io", &self.io.len())
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

pub(crate) fn is_cancelled(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ECANCELED)
}
