use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

/// Whether the underlying transport can currently carry protocol traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportReadiness {
    /// The link can carry data
    Ready,
    /// The link cannot carry data right now
    NotReady(NotReadyReason),
}

impl TransportReadiness {
    /// Whether the transport is ready
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Why the transport cannot carry data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotReadyReason {
    /// A connection attempt is still in progress
    Connecting,
    /// The link is down
    Disconnected,
    /// The link is up but traffic is administratively held
    Suspended,
}

impl fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Disconnected => "disconnected",
            Self::Suspended => "suspended",
        })
    }
}

/// Creates a readiness signal: one authoritative writer (owned by the
/// transport layer) and a broadcast read-only watch.
pub fn readiness_channel(
    initial: TransportReadiness,
) -> (watch::Sender<TransportReadiness>, ReadinessWatch) {
    let (tx, rx) = watch::channel(initial);
    (tx, ReadinessWatch { rx, _owner: None })
}

/// Read side of the transport-readiness signal.
///
/// Clones observe the same authoritative writer.
#[derive(Debug, Clone)]
pub struct ReadinessWatch {
    rx: watch::Receiver<TransportReadiness>,
    // keeps the writer alive for the always-ready convenience watch
    _owner: Option<Arc<watch::Sender<TransportReadiness>>>,
}

impl ReadinessWatch {
    /// A watch that always reports [`TransportReadiness::Ready`]
    pub fn always_ready() -> Self {
        let (tx, rx) = watch::channel(TransportReadiness::Ready);
        Self {
            rx,
            _owner: Some(Arc::new(tx)),
        }
    }

    /// The readiness value right now
    pub fn current(&self) -> TransportReadiness {
        self.rx.borrow().clone()
    }

    /// Resolves as soon as the transport is, or becomes, not ready.
    ///
    /// A dropped writer is reported as [`NotReadyReason::Disconnected`].
    pub async fn unavailable(&mut self) -> NotReadyReason {
        loop {
            if let TransportReadiness::NotReady(reason) = &*self.rx.borrow_and_update() {
                return *reason;
            }
            if self.rx.changed().await.is_err() {
                return NotReadyReason::Disconnected;
            }
        }
    }
}
