use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// An asynchronous mutual-exclusion primitive with strict FIFO admission.
///
/// Each [`acquire`](Self::acquire) call takes a monotonically increasing
/// ticket; a caller is admitted once its ticket reaches the head of the
/// queue, so the holder sequence always equals the acquisition sequence, no
/// matter in which order holders release. Cancelling a pending acquisition
/// (dropping its future) vacates the queue position so later tickets are not
/// starved.
///
/// Handles are cheap clones sharing one queue.
#[derive(Debug, Clone)]
pub struct FifoLock {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<LockState>,
}

#[derive(Debug)]
struct LockState {
    queue: VecDeque<Waiter>,
    next_ticket: u64,
}

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    waker: Option<Waker>,
}

impl FifoLock {
    /// Creates an unheld lock
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LockState {
                    queue: VecDeque::new(),
                    next_ticket: 0,
                }),
            }),
        }
    }

    /// Waits until this caller's ticket reaches the head of the queue.
    ///
    /// The lock is released when the returned guard is dropped.
    pub fn acquire(&self) -> Acquire {
        Acquire {
            shared: self.shared.clone(),
            ticket: None,
            acquired: false,
        }
    }

    /// Runs `operation` while holding the lock.
    ///
    /// The operation is not polled before the lock is held, and the lock is
    /// released as soon as the operation reaches a terminal state, including
    /// cancellation of the whole composed future.
    pub async fn synchronized<F: Future>(&self, operation: F) -> F::Output {
        let _guard = self.acquire().await;
        operation.await
    }
}

impl Default for FifoLock {
    fn default() -> Self {
        Self::new()
    }
}

impl LockState {
    fn wake_head(&mut self) {
        if let Some(head) = self.queue.front_mut() {
            if let Some(waker) = head.waker.take() {
                waker.wake();
            }
        }
    }

    /// Removes `ticket` from the queue, admitting the next waiter if the
    /// head changed.
    fn vacate(&mut self, ticket: u64) {
        if let Some(index) = self.queue.iter().position(|w| w.ticket == ticket) {
            self.queue.remove(index);
            if index == 0 {
                self.wake_head();
            }
        }
    }
}

/// Future returned by [`FifoLock::acquire`]
#[derive(Debug)]
pub struct Acquire {
    shared: Arc<Shared>,
    ticket: Option<u64>,
    acquired: bool,
}

impl Future for Acquire {
    type Output = FifoLockGuard;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.shared.state.lock().unwrap();

        let ticket = match this.ticket {
            Some(ticket) => ticket,
            None => {
                let ticket = state.next_ticket;
                state.next_ticket += 1;
                state.queue.push_back(Waiter {
                    ticket,
                    waker: None,
                });
                this.ticket = Some(ticket);
                ticket
            }
        };

        if state.queue.front().map(|w| w.ticket) == Some(ticket) {
            this.acquired = true;
            Poll::Ready(FifoLockGuard {
                shared: this.shared.clone(),
                ticket,
            })
        } else {
            if let Some(waiter) = state.queue.iter_mut().find(|w| w.ticket == ticket) {
                waiter.waker = Some(cx.waker().clone());
            }
            Poll::Pending
        }
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        // a cancelled pending acquisition must vacate its queue position
        if let Some(ticket) = self.ticket {
            if !self.acquired {
                self.shared.state.lock().unwrap().vacate(ticket);
            }
        }
    }
}

/// Holds the lock until dropped
#[derive(Debug)]
pub struct FifoLockGuard {
    shared: Arc<Shared>,
    ticket: u64,
}

impl Drop for FifoLockGuard {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().vacate(self.ticket);
    }
}
