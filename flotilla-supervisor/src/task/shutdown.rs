use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::errors::ShutdownCause;

/// The single cancellation source of a run, plus the first recorded reason
/// for using it.
///
/// Signals, the config watcher and failing tasks all funnel through
/// [`ShutdownHandle::shutdown`]. Only the first cause sticks.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    token: CancellationToken,
    cause: Arc<Mutex<Option<ShutdownCause>>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle cancelled together with `parent`
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            cause: Arc::default(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Record `cause` unless one is already set, then cancel.
    ///
    /// If the token was already cancelled without a recorded cause (someone
    /// cancelled a parent token), that cancellation counts as first.
    /// Returns true if `cause` is the one that was recorded.
    pub fn shutdown(&self, cause: ShutdownCause) -> bool {
        let recorded = {
            let mut slot = self.cause.lock();
            if slot.is_some() {
                false
            } else if self.token.is_cancelled() {
                *slot = Some(ShutdownCause::Cancelled);
                false
            } else {
                *slot = Some(cause);
                true
            }
        };
        self.token.cancel();
        recorded
    }

    /// The recorded cause, if any. A cancelled token with nothing recorded
    /// reports `Cancelled`.
    pub fn cause(&self) -> Option<ShutdownCause> {
        let slot = self.cause.lock();
        match &*slot {
            Some(cause) => Some(cause.clone()),
            None if self.token.is_cancelled() => Some(ShutdownCause::Cancelled),
            None => None,
        }
    }
}
