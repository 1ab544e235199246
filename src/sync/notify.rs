//! Change-notification capability.
//!
//! A [`ChangeSource`] is whatever watches the host tree (a DOM mutation
//! observer, a scene-graph listener, [`MemoryTree`](crate::tree::MemoryTree)
//! itself). It holds [`ChangeNotifier`]s and calls [`ChangeNotifier::notify`]
//! whenever the tree may have changed. Notifiers hold a weak reference to
//! their engine, so a source never keeps an engine alive.

use std::fmt;
use std::sync::Weak;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a connected observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObserverId(Uuid);

impl ObserverId {
    /// Create a new random observer id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObserverId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receiver side of a notification; implemented by the engine.
pub(crate) trait TaintSink: Send + Sync {
    fn taint(&self);
}

/// Handle a change source calls when the tree may have changed.
#[derive(Clone)]
pub struct ChangeNotifier {
    id: ObserverId,
    target: Weak<dyn TaintSink>,
}

impl ChangeNotifier {
    pub(crate) fn new(id: ObserverId, target: Weak<dyn TaintSink>) -> Self {
        Self { id, target }
    }

    /// The observer this notifier belongs to.
    #[must_use]
    pub const fn id(&self) -> ObserverId {
        self.id
    }

    /// Records a possible tree change. Returns false once the engine is gone.
    pub fn notify(&self) -> bool {
        match self.target.upgrade() {
            Some(target) => {
                target.taint();
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("id", &self.id)
            .field("alive", &(self.target.strong_count() > 0))
            .finish()
    }
}

/// Source of "the tree may have changed" notifications.
pub trait ChangeSource: Send + Sync {
    /// Starts delivering notifications to `notifier`. Connecting the same
    /// observer twice must not duplicate deliveries.
    fn connect(&self, notifier: ChangeNotifier);

    /// Stops delivering notifications to `observer`.
    fn disconnect(&self, observer: ObserverId);
}
