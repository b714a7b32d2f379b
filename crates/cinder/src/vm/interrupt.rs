//! Process-wide interrupt flag.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

const NONE: u8 = 0;
const RECEIVED: u8 = 1;

/// A shared, cooperatively checked interrupt request.
///
/// The host calls [`signal`](Self::signal) (typically from a Ctrl-C
/// handler); the scheduler polls the flag between slices and every few
/// hundred instructions and raises `Interrupt` inside the running task.
#[derive(Clone, Default)]
pub struct Interrupt {
    state: Arc<AtomicU8>,
}

impl Interrupt {
    /// Create a flag with no pending request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an interrupt.
    ///
    /// Returns `true` if the previous request was never picked up, meaning
    /// the running script is not reaching a check point and the host should
    /// give up on it.
    pub fn signal(&self) -> bool {
        self.state.swap(RECEIVED, Ordering::SeqCst) == RECEIVED
    }

    /// Consume a pending request.
    pub fn take(&self) -> bool {
        self.state.swap(NONE, Ordering::SeqCst) == RECEIVED
    }

    /// Whether a request is pending.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RECEIVED
    }
}

impl fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupt")
            .field("pending", &self.is_pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_signal_reports_unhandled() {
        let interrupt = Interrupt::new();
        assert!(!interrupt.signal());
        assert!(interrupt.signal());
        assert!(interrupt.take());
        assert!(!interrupt.take());
        assert!(!interrupt.signal());
    }

    #[test]
    fn test_clones_share_state() {
        let interrupt = Interrupt::new();
        let handle = interrupt.clone();
        handle.signal();
        assert!(interrupt.is_pending());
    }
}
