//! Out-of-band failure reporting.
//!
//! Failures inside a reconciliation pass (a panicking callback, a matcher
//! that cannot be evaluated, a pass loop that never settles) never unwind
//! into the engine's caller. They are logged and queued on a bounded channel
//! that hosts drain through a [`FaultStream`]. When nobody drains it, new
//! faults are dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use uuid::Uuid;

use crate::error::EvaluationError;
use crate::rule::RuleId;

/// What went wrong.
#[derive(Debug, Clone, PartialEq)]
pub enum FaultKind<N> {
    /// An enter callback panicked. The node stays matched.
    MatchCallback {
        /// The node being announced.
        node: N,
        /// Panic payload, if it was a string.
        message: String,
    },
    /// An exit callback panicked. The node stays unmatched.
    UnmatchCallback {
        /// The node being announced.
        node: N,
        /// Panic payload, if it was a string.
        message: String,
    },
    /// The rule's matcher could not be evaluated; the rule was skipped.
    Evaluation(EvaluationError),
    /// The loop-until-stable cap was hit and the engine force-settled.
    PassLimitExceeded {
        /// Passes run before giving up.
        passes: usize,
    },
}

/// A contained failure.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncFault<N> {
    /// Unique id of this fault.
    pub fault_id: Uuid,
    /// Rule involved, if the fault is rule-specific.
    pub rule_id: Option<RuleId>,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Details.
    pub kind: FaultKind<N>,
}

impl<N> SyncFault<N> {
    /// Creates a fault stamped with the current time.
    #[must_use]
    pub fn new(rule_id: Option<RuleId>, kind: FaultKind<N>) -> Self {
        Self {
            fault_id: Uuid::new_v4(),
            rule_id,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Returns true for callback failures.
    #[must_use]
    pub const fn is_callback(&self) -> bool {
        matches!(
            self.kind,
            FaultKind::MatchCallback { .. } | FaultKind::UnmatchCallback { .. }
        )
    }
}

/// Engine-side writer.
#[derive(Debug)]
pub(crate) struct FaultSink<N> {
    tx: Sender<SyncFault<N>>,
    rx: Receiver<SyncFault<N>>,
    dropped: Arc<AtomicU64>,
}

impl<N> FaultSink<N>
where
    N: std::fmt::Debug,
{
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Logs and enqueues; never blocks.
    pub(crate) fn report(&self, fault: SyncFault<N>) {
        match &fault.kind {
            FaultKind::MatchCallback { node, message } => {
                tracing::error!(rule = ?fault.rule_id, ?node, %message, "match callback panicked");
            }
            FaultKind::UnmatchCallback { node, message } => {
                tracing::error!(rule = ?fault.rule_id, ?node, %message, "unmatch callback panicked");
            }
            FaultKind::Evaluation(error) => {
                tracing::warn!(rule = ?fault.rule_id, %error, "rule evaluation failed; rule skipped this pass");
            }
            FaultKind::PassLimitExceeded { passes } => {
                tracing::warn!(passes, "reconciliation did not settle; forcing settle");
            }
        }

        match self.tx.try_send(fault) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn stream(&self) -> FaultStream<N> {
        FaultStream {
            rx: self.rx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Reader for contained failures.
///
/// Streams share one queue: each fault is delivered to exactly one reader.
#[derive(Debug, Clone)]
pub struct FaultStream<N> {
    rx: Receiver<SyncFault<N>>,
    dropped: Arc<AtomicU64>,
}

impl<N> FaultStream<N> {
    /// Next fault, if one is queued.
    #[must_use]
    pub fn try_recv(&self) -> Option<SyncFault<N>> {
        match self.rx.try_recv() {
            Ok(fault) => Some(fault),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Waits up to `timeout` for the next fault.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SyncFault<N>> {
        match self.rx.recv_timeout(timeout) {
            Ok(fault) => Some(fault),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Drains every queued fault.
    #[must_use]
    pub fn drain(&self) -> Vec<SyncFault<N>> {
        self.rx.try_iter().collect()
    }

    /// Faults dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
