//! Cancellation plumbing.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::debug;

type Handler = Box<dyn FnOnce(&str) + Send>;

enum State {
    Active { handlers: Vec<Handler> },
    Cancelled { reason: String },
    Abandoned,
}

/// A one-shot cancellation switch with attached handlers.
///
/// `cancel` is idempotent: the first call transitions to the terminal
/// cancelled state, runs every registered handler exactly once, and trips
/// the token so that futures racing against it resolve with a cancellation
/// error. `abandon` transitions to a terminal state in which cancellation
/// can no longer happen.
#[derive(Clone)]
pub struct Canceller {
    token: CancellationToken,
    state: Arc<Mutex<State>>,
}

impl Default for Canceller {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Canceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().expect("canceller lock poisoned");
        let rendered = match &*state {
            State::Active { handlers } => format!("active({} handlers)", handlers.len()),
            State::Cancelled { reason } => format!("cancelled({reason:?})"),
            State::Abandoned => "abandoned".to_string(),
        };
        write!(f, "Canceller({rendered})")
    }
}

impl Canceller {
    /// Create an active canceller with no handlers.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            state: Arc::new(Mutex::new(State::Active {
                handlers: Vec::new(),
            })),
        }
    }

    /// Create a canceller with one handler already attached.
    pub fn with_handler(handler: impl FnOnce(&str) + Send + 'static) -> Self {
        let canceller = Self::new();
        canceller.add_handler(handler);
        canceller
    }

    /// Attach a handler to run on cancellation.
    ///
    /// Handlers chain: each registered handler runs once, in registration
    /// order. Registering on an already-cancelled canceller runs the
    /// handler immediately; registering on an abandoned one drops it.
    pub fn add_handler(&self, handler: impl FnOnce(&str) + Send + 'static) {
        let run_now = {
            let mut state = self.state.lock().expect("canceller lock poisoned");
            match &mut *state {
                State::Active { handlers } => {
                    handlers.push(Box::new(handler));
                    None
                }
                State::Cancelled { reason } => Some((Box::new(handler) as Handler, reason.clone())),
                State::Abandoned => None,
            }
        };
        if let Some((handler, reason)) = run_now {
            handler(&reason);
        }
    }

    /// Cancel, invoking handlers with the given reason. Idempotent; only
    /// the first call has any effect.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let handlers = {
            let mut state = self.state.lock().expect("canceller lock poisoned");
            match &mut *state {
                State::Active { handlers } => {
                    let handlers = std::mem::take(handlers);
                    *state = State::Cancelled {
                        reason: reason.clone(),
                    };
                    handlers
                }
                State::Cancelled { .. } | State::Abandoned => return,
            }
        };
        debug!(%reason, handlers = handlers.len(), "cancelling");
        for handler in handlers {
            handler(&reason);
        }
        self.token.cancel();
    }

    /// Transition to the terminal non-cancelling state, dropping handlers.
    /// A no-op if already cancelled.
    pub fn abandon(&self) {
        let mut state = self.state.lock().expect("canceller lock poisoned");
        if matches!(&*state, State::Active { .. }) {
            *state = State::Abandoned;
        }
    }

    /// Whether `cancel` has taken effect.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            &*self.state.lock().expect("canceller lock poisoned"),
            State::Cancelled { .. }
        )
    }

    /// The cancellation reason, if cancelled.
    pub fn reason(&self) -> Option<String> {
        match &*self.state.lock().expect("canceller lock poisoned") {
            State::Cancelled { reason } => Some(reason.clone()),
            _ => None,
        }
    }

    /// The token futures race against.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// A child canceller that is cancelled when this one is.
    pub fn child(&self) -> Canceller {
        let child = Canceller::new();
        let chained = child.clone();
        self.add_handler(move |reason| chained.cancel(reason));
        child
    }
}
