//! Per-connection lifecycle state machine
//!
//! `connecting -> authenticated -> ready -> closing`. Inbound client
//! events are only accepted in `ready`; anything earlier is rejected with
//! `NotReady`, anything after close is dropped.

use std::sync::Mutex;

use livedesk_shared::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Authenticated,
    Ready,
    Closing,
}

impl ConnectionPhase {
    fn may_become(self, next: ConnectionPhase) -> bool {
        use ConnectionPhase::*;
        matches!(
            (self, next),
            (Connecting, Authenticated) | (Authenticated, Ready) | (_, Closing)
        )
    }
}

/// Thread-safe phase holder for one connection.
#[derive(Debug)]
pub struct PhaseTracker {
    phase: Mutex<ConnectionPhase>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(ConnectionPhase::Connecting),
        }
    }

    pub fn current(&self) -> ConnectionPhase {
        match self.phase.lock() {
            Ok(guard) => *guard,
            // A poisoned lock means another task panicked mid-transition;
            // treat the connection as closing
            Err(_) => ConnectionPhase::Closing,
        }
    }

    /// Advance to the next phase. Skipping a phase is a state error.
    pub fn advance(&self, next: ConnectionPhase) -> CoreResult<()> {
        let mut guard = self
            .phase
            .lock()
            .map_err(|_| CoreError::State("connection state poisoned".to_string()))?;
        if !guard.may_become(next) {
            return Err(CoreError::State(format!(
                "cannot move from {:?} to {:?}",
                *guard, next
            )));
        }
        *guard = next;
        Ok(())
    }

    /// Client events are only legal in `ready`.
    pub fn ensure_ready(&self) -> CoreResult<()> {
        match self.current() {
            ConnectionPhase::Ready => Ok(()),
            _ => Err(CoreError::NotReady),
        }
    }

    pub fn is_closing(&self) -> bool {
        self.current() == ConnectionPhase::Closing
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]  // Allow unwrap() in tests for cleaner test code
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let tracker = PhaseTracker::new();
        assert_eq!(tracker.current(), ConnectionPhase::Connecting);
        assert!(tracker.ensure_ready().is_err());

        tracker.advance(ConnectionPhase::Authenticated).unwrap();
        assert!(matches!(
            tracker.ensure_ready(),
            Err(CoreError::NotReady)
        ));

        tracker.advance(ConnectionPhase::Ready).unwrap();
        assert!(tracker.ensure_ready().is_ok());

        tracker.advance(ConnectionPhase::Closing).unwrap();
        assert!(tracker.is_closing());
        assert!(tracker.ensure_ready().is_err());
    }

    #[test]
    fn test_phase_skips_are_rejected() {
        let tracker = PhaseTracker::new();
        assert!(matches!(
            tracker.advance(ConnectionPhase::Ready),
            Err(CoreError::State(_))
        ));

        // Closing is reachable from anywhere, but terminal
        tracker.advance(ConnectionPhase::Closing).unwrap();
        assert!(tracker.advance(ConnectionPhase::Authenticated).is_err());
    }
}
