//! Single-assignment result handle shared between a connection's read path
//! and the caller.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::error::LdapError;

type Outcome<T> = Arc<Result<T, LdapError>>;
type CompletionHandler<T> = Box<dyn FnOnce(&Result<T, LdapError>) + Send>;
type CancelHook = Box<dyn FnOnce() + Send>;

/// Result of one in-flight operation. Completed exactly once, with either the
/// decoded result or an error; every clone observes the same outcome.
pub struct FutureResult<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    message_id: i32,
    state: Mutex<State<T>>,
    condvar: Condvar,
    notify: Notify,
}

struct State<T> {
    outcome: Option<Outcome<T>>,
    // Set once the first search entry or intermediate response is delivered.
    delivering: bool,
    handlers: Vec<CompletionHandler<T>>,
    cancel_hook: Option<CancelHook>,
}

impl<T> Clone for FutureResult<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for FutureResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureResult")
            .field("message_id", &self.shared.message_id)
            .field("done", &self.is_done())
            .finish()
    }
}

impl<T> FutureResult<T> {
    pub(crate) fn new(message_id: i32) -> Self {
        Self {
            shared: Arc::new(Shared {
                message_id,
                state: Mutex::new(State {
                    outcome: None,
                    delivering: false,
                    handlers: Vec::new(),
                    cancel_hook: None,
                }),
                condvar: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn message_id(&self) -> i32 {
        self.shared.message_id
    }

    pub fn is_done(&self) -> bool {
        self.lock().outcome.is_some()
    }

    /// Sets the terminal outcome. Returns false, leaving the first outcome in
    /// place, if the future was already complete.
    pub(crate) fn complete(&self, outcome: Result<T, LdapError>) -> bool {
        let (outcome, handlers) = {
            let mut state = self.lock();
            if state.outcome.is_some() {
                return false;
            }
            let outcome = Arc::new(outcome);
            state.outcome = Some(Arc::clone(&outcome));
            state.cancel_hook = None;
            (outcome, std::mem::take(&mut state.handlers))
        };
        self.wake();
        for handler in handlers {
            handler(outcome.as_ref());
        }
        true
    }

    fn wake(&self) {
        self.shared.condvar.notify_all();
        self.shared.notify.notify_waiters();
    }

    pub(crate) fn mark_delivering(&self) {
        self.lock().delivering = true;
    }

    /// Runs when `cancel()` succeeds, after the outcome is set.
    pub(crate) fn set_cancel_hook(&self, hook: impl FnOnce() + Send + 'static) {
        let mut state = self.lock();
        if state.outcome.is_none() {
            state.cancel_hook = Some(Box::new(hook));
        }
    }

    /// Completes the future with `LdapError::Cancelled` and abandons the
    /// operation. Fails once a result has been received or has started to
    /// arrive.
    pub fn cancel(&self) -> bool {
        let (outcome, handlers, hook) = {
            let mut state = self.lock();
            if state.outcome.is_some() || state.delivering {
                return false;
            }
            let outcome: Outcome<T> = Arc::new(Err(LdapError::Cancelled));
            state.outcome = Some(Arc::clone(&outcome));
            (outcome, std::mem::take(&mut state.handlers), state.cancel_hook.take())
        };
        self.wake();
        if let Some(hook) = hook {
            hook();
        }
        for handler in handlers {
            handler(outcome.as_ref());
        }
        true
    }

    /// Registers a callback invoked exactly once with the outcome. Runs
    /// immediately on the calling thread if the future is already complete.
    pub fn on_complete(&self, handler: impl FnOnce(&Result<T, LdapError>) + Send + 'static) {
        let outcome = {
            let mut state = self.lock();
            match state.outcome.clone() {
                Some(outcome) => outcome,
                None => {
                    state.handlers.push(Box::new(handler));
                    return;
                }
            }
        };
        handler(outcome.as_ref());
    }
}

impl<T: Clone> FutureResult<T> {
    pub fn try_result(&self) -> Option<Result<T, LdapError>> {
        self.lock().outcome.as_ref().map(|outcome| (**outcome).clone())
    }

    /// Blocks the calling thread until the outcome is set. Must not be called
    /// from an async task running on the connection's runtime.
    pub fn get(&self) -> Result<T, LdapError> {
        let mut state = self.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return (**outcome).clone();
            }
            state = self
                .shared
                .condvar
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like `get`, but gives up with `LdapError::Timeout` after `timeout`.
    /// The operation itself stays pending.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, LdapError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return (**outcome).clone();
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LdapError::Timeout(timeout));
            }
            state = self
                .shared
                .condvar
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub async fn result(&self) -> Result<T, LdapError> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(outcome) = self.try_result() {
                return outcome;
            }
            notified.await;
        }
    }
}
