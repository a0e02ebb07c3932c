use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::Notify;

/// Error returned when a second consumer attaches to a [`SingleUseCache`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("single-use cache already had a consumer")]
pub struct AlreadyUsed;

/// A one-shot broadcast cell that hands a sequence of values plus a terminal
/// event to exactly one consumer.
///
/// Values emitted before the consumer attaches are buffered and replayed in
/// emission order, after which the consumer observes live events. A second
/// attachment attempt fails immediately with [`AlreadyUsed`]. Once the sole
/// consumer detaches the cache is resolved and buffered values are released
/// eagerly; later events are silently dropped.
///
/// Producer handles are cheap clones sharing the same cell.
#[derive(Debug)]
pub struct SingleUseCache<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for SingleUseCache<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

#[derive(Debug)]
struct Shared<T, E> {
    state: Mutex<State<T, E>>,
    notify: Notify,
}

#[derive(Debug)]
enum State<T, E> {
    /// No events yet, no consumer yet
    Pristine,
    /// Events emitted while the consumer is still to come
    Buffering {
        events: VecDeque<T>,
        terminal: Option<Terminal<E>>,
    },
    /// Consumer attached and draining
    Attached {
        pending: VecDeque<T>,
        terminal: Option<Terminal<E>>,
    },
    /// Terminal event consumed, or the consumer detached
    Resolved,
}

#[derive(Debug)]
enum Terminal<E> {
    Completed,
    Failed(E),
}

impl<T, E> SingleUseCache<T, E> {
    /// Creates a pristine cache
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pristine),
                notify: Notify::new(),
            }),
        }
    }

    /// Emits a value: buffered if no consumer attached yet, forwarded live if
    /// one is, dropped if the cache is already resolved or terminated.
    pub fn emit(&self, value: T) {
        let mut state = self.shared.state.lock().unwrap();
        match &mut *state {
            State::Pristine => {
                *state = State::Buffering {
                    events: VecDeque::from([value]),
                    terminal: None,
                };
            }
            State::Buffering { events, terminal } | State::Attached { pending: events, terminal } => {
                if terminal.is_none() {
                    events.push_back(value);
                }
            }
            State::Resolved => return,
        }
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Marks the sequence complete
    pub fn complete(&self) {
        self.terminate(Terminal::Completed);
    }

    /// Fails the sequence
    pub fn fail(&self, error: E) {
        self.terminate(Terminal::Failed(error));
    }

    fn terminate(&self, event: Terminal<E>) {
        let mut state = self.shared.state.lock().unwrap();
        match &mut *state {
            State::Pristine => {
                *state = State::Buffering {
                    events: VecDeque::new(),
                    terminal: Some(event),
                };
            }
            State::Buffering { terminal, .. } | State::Attached { terminal, .. } => {
                if terminal.is_none() {
                    *terminal = Some(event);
                }
            }
            State::Resolved => return,
        }
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Attaches the sole consumer, yielding a stream that replays any
    /// buffered events and then continues live.
    pub fn attach(&self) -> Result<CacheStream<T, E>, AlreadyUsed> {
        let mut state = self.shared.state.lock().unwrap();
        match std::mem::replace(&mut *state, State::Resolved) {
            State::Pristine => {
                *state = State::Attached {
                    pending: VecDeque::new(),
                    terminal: None,
                };
            }
            State::Buffering { events, terminal } => {
                *state = State::Attached {
                    pending: events,
                    terminal,
                };
            }
            other @ (State::Attached { .. } | State::Resolved) => {
                *state = other;
                return Err(AlreadyUsed);
            }
        }
        Ok(CacheStream {
            shared: self.shared.clone(),
        })
    }
}

impl<T, E> Default for SingleUseCache<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

/// The sole consumer of a [`SingleUseCache`].
///
/// Dropping the stream resolves the cache and releases any values still
/// buffered.
#[derive(Debug)]
pub struct CacheStream<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> CacheStream<T, E> {
    /// Waits for the next event.
    ///
    /// Yields `Some(Ok(value))` per emitted value in order, `Some(Err(_))` if
    /// the sequence failed, and `None` once it completed.
    pub async fn next(&mut self) -> Option<Result<T, E>> {
        loop {
            {
                let mut state = self.shared.state.lock().unwrap();
                match &mut *state {
                    State::Attached { pending, terminal } => {
                        if let Some(value) = pending.pop_front() {
                            return Some(Ok(value));
                        }
                        match terminal.take() {
                            Some(Terminal::Completed) => {
                                *state = State::Resolved;
                                return None;
                            }
                            Some(Terminal::Failed(error)) => {
                                *state = State::Resolved;
                                return Some(Err(error));
                            }
                            None => {}
                        }
                    }
                    // detached or already terminal
                    _ => return None,
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Collects all values into one aggregate result, delivered on the
    /// terminal event.
    pub async fn collect(mut self) -> Result<Vec<T>, E> {
        let mut values = Vec::new();
        while let Some(event) = self.next().await {
            values.push(event?);
        }
        Ok(values)
    }
}

impl<T, E> Drop for CacheStream<T, E> {
    fn drop(&mut self) {
        *self.shared.state.lock().unwrap() = State::Resolved;
    }
}
