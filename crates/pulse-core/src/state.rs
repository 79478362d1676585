//! Per-connection state.
//!
//! Every connection gets its own `S`, built by the pool's [`StateFactory`].
//! The worker hands a [`ConnectionState`] to each action it dispatches, so the
//! same state can be reached by several in-flight actions of one connection,
//! but never by another connection.
//!
//! Access goes through short synchronous critical sections:
//!
//! ```rust,ignore
//! #[derive(Default)]
//! struct Table {
//!     hand: Vec<String>,
//! }
//!
//! let card = state.with(|table| table.hand.pop());
//! ```
//!
//! The guard never escapes the closure, so a lock cannot be held across an
//! `.await`. Actions that wait for a condition poll it with [`ConnectionState::wait_until`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Builds a fresh state instance for each connection.
pub type StateFactory<S> = Arc<dyn Fn() -> S + Send + Sync>;

/// Handle to the private state of one connection.
pub struct ConnectionState<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> ConnectionState<S> {
    /// Wraps a freshly built state.
    pub fn new(state: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Runs `f` with exclusive access to the state.
    pub fn with<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Replaces the state, returning the previous value.
    pub fn replace(&self, state: S) -> S {
        std::mem::replace(&mut *self.inner.lock(), state)
    }

    /// Polls `f` every `interval` until it yields a value.
    ///
    /// The lock is released between polls so other actions of the same
    /// connection keep making progress.
    pub async fn wait_until<R>(
        &self,
        interval: Duration,
        mut f: impl FnMut(&mut S) -> Option<R>,
    ) -> R {
        loop {
            if let Some(value) = self.with(&mut f) {
                return value;
            }
            tokio::time::sleep(interval).await;
        }
    }
}

impl<S: Clone> ConnectionState<S> {
    /// Returns a copy of the current state.
    pub fn snapshot(&self) -> S {
        self.inner.lock().clone()
    }
}

impl<S> Clone for ConnectionState<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> fmt::Debug for ConnectionState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionState")
            .field("handles", &Arc::strong_count(&self.inner))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone)]
    struct Counter {
        hits: u32,
    }

    #[test]
    fn test_clones_share_state() {
        let state = ConnectionState::new(Counter::default());
        let other = state.clone();

        other.with(|c| c.hits += 2);
        state.with(|c| c.hits += 1);

        assert_eq!(state.snapshot().hits, 3);
    }

    #[test]
    fn test_replace() {
        let state = ConnectionState::new(Counter { hits: 7 });
        let old = state.replace(Counter::default());
        assert_eq!(old.hits, 7);
        assert_eq!(state.snapshot().hits, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_sees_later_writes() {
        let state = ConnectionState::new(Vec::<u32>::new());
        let writer = state.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer.with(|v| v.push(9));
        });

        let value = state
            .wait_until(Duration::from_millis(5), |v| v.pop())
            .await;
        assert_eq!(value, 9);
    }
}
