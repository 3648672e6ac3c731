use std::cell::Cell;

/// Lifecycle state of a [`Stream`](crate::Stream).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Not open. Streams start here and return here after close.
    Closed,
    /// An open is in flight.
    Opening,
    /// Open and ready for I/O.
    Opened,
}

/// Holds a [`State`] and centralizes every transition.
#[derive(Debug)]
pub(crate) struct StateCell(Cell<State>);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(Cell::new(State::Closed))
    }

    pub(crate) fn get(&self) -> State {
        self.0.get()
    }

    /// Move from `from` to `to`, returning false if the current state is not `from`.
    pub(crate) fn try_transition(&self, from: State, to: State) -> bool {
        if self.0.get() != from {
            return false;
        }
        self.0.set(to);
        true
    }

    /// Move from `from` to `to`, panicking if the current state is not `from`.
    #[track_caller]
    pub(crate) fn transition(&self, from: State, to: State) {
        let current = self.0.get();
        assert!(
            self.try_transition(from, to),
            "invalid state transition {:?} -> {:?} while {:?}",
            from,
            to,
            current
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_requires_expected_state() {
        let state = StateCell::new();
        assert!(!state.try_transition(State::Opening, State::Opened));
        assert_eq!(state.get(), State::Closed);

        assert!(state.try_transition(State::Closed, State::Opening));
        assert!(!state.try_transition(State::Closed, State::Opening));
        assert!(state.try_transition(State::Opening, State::Opened));
        assert_eq!(state.get(), State::Opened);
    }

    #[test]
    #[should_panic(expected = "invalid state transition Opened -> Closed while Closed")]
    fn strict_transition_catches_wrong_state() {
        let state = StateCell::new();
        state.transition(State::Opened, State::Closed);
    }
}
