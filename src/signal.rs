//! Boolean signal combinators.
//!
//! Fold a set of boolean watch channels into one derived channel. The result
//! always reflects the latest value of every source and is re-emitted only
//! when the folded value actually changes; unrelated source changes produce
//! no emission. Combinators spawn onto the current Tokio runtime.

use tokio::sync::{mpsc, watch};

/// Logical AND over the latest value of each source
pub fn all(inputs: Vec<watch::Receiver<bool>>) -> watch::Receiver<bool> {
    combine(inputs, |values| values.iter().all(|v| *v))
}

/// Logical OR over the latest value of each source
pub fn any(inputs: Vec<watch::Receiver<bool>>) -> watch::Receiver<bool> {
    combine(inputs, |values| values.iter().any(|v| *v))
}

/// Logical negation of a source
pub fn not(input: watch::Receiver<bool>) -> watch::Receiver<bool> {
    combine(vec![input], |values| !values[0])
}

fn combine<F>(inputs: Vec<watch::Receiver<bool>>, fold: F) -> watch::Receiver<bool>
where
    F: Fn(&[bool]) -> bool + Send + 'static,
{
    let snapshot: Vec<bool> = inputs.iter().map(|rx| *rx.borrow()).collect();
    let (tx, rx) = watch::channel(fold(&snapshot));

    let (tick_tx, mut tick_rx) = mpsc::unbounded_channel();
    for input in &inputs {
        let mut input = input.clone();
        let tick_tx = tick_tx.clone();
        tokio::spawn(async move {
            while input.changed().await.is_ok() {
                if tick_tx.send(()).is_err() {
                    break;
                }
            }
        });
    }

    tokio::spawn(async move {
        // ends once every source writer is gone or all readers detached
        while tick_rx.recv().await.is_some() {
            if tx.is_closed() {
                break;
            }
            let snapshot: Vec<bool> = inputs.iter().map(|rx| *rx.borrow()).collect();
            let value = fold(&snapshot);
            tx.send_if_modified(|current| {
                if *current != value {
                    *current = value;
                    true
                } else {
                    false
                }
            });
        }
    });

    rx
}
