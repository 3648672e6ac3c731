use std::cell::RefCell;

use crate::Handle;

thread_local! {
    static CURRENT: RefCell<Option<Handle>> = const { RefCell::new(None) };
}

pub(crate) struct Context;

impl Context {
    pub(crate) fn enter(handle: Handle) -> ContextGuard {
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            assert!(current.is_none(), "reactor already set");
            *current = Some(handle);
        });
        ContextGuard { _p: () }
    }

    /// Returns a handle to the reactor entered on this thread.
    pub(crate) fn handle() -> Option<Handle> {
        CURRENT.with(|current| current.borrow().clone())
    }
}

/// Guard returned by [`Reactor::enter`](crate::Reactor::enter).
///
/// [`Handle::current`] resolves to the entered reactor until the guard is
/// dropped.
#[derive(Debug)]
pub struct ContextGuard {
    _p: (),
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| {
            let handle = current.borrow_mut().take();
            assert!(handle.is_some(), "reactor not set");
        });
    }
}
