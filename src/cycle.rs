//! # Correction cycle
//!
//! ```text
//!            Collect
//!   Idle ──────────────▶ Collecting ◀─┐ Collect
//!    ▲  ◀──────────────      │  └─────┘
//!    │      Discard          │ Compute
//!    │                       ▼
//!    ├────────────────── Computing
//!    │      Abort            │ Issue
//!    │                       ▼
//!    ├────────────────── Issuing ───────────────┐
//!    │      Abort            │ Commit           │ PartialReject
//!    │                       ▼                  ▼
//!    ├─────────────────  Committed     PartiallyRejected
//!    │      Finish                              │
//!    └──────────────────────────────────────────┘ Finish
//! ```
//! `Reset` returns to `Idle` from any state.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Correction cycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CycleState {
    #[default]
    Idle,
    /// Wavefront errors are being accumulated
    Collecting,
    /// The feedback solver is running
    Computing,
    /// Commands are in flight
    Issuing,
    /// Every issued command was accepted
    Committed,
    /// At least one issued command was rejected and rolled back
    PartiallyRejected,
}
impl CycleState {
    /// Returns `true` while a correction is being computed or issued
    pub fn is_active(&self) -> bool {
        matches!(self, CycleState::Computing | CycleState::Issuing)
    }
    /// Returns the state following `event`
    pub fn next(self, event: CycleEvent) -> Result<Self> {
        use CycleEvent::*;
        use CycleState::*;
        match (self, event) {
            (_, Reset) => Ok(Idle),
            (Idle | Collecting, Collect) => Ok(Collecting),
            (Collecting, Discard) => Ok(Idle),
            (Collecting, Compute) => Ok(Computing),
            (Computing, Issue) => Ok(Issuing),
            (Computing | Issuing, Abort) => Ok(Idle),
            (Issuing, Commit) => Ok(Committed),
            (Issuing, PartialReject) => Ok(PartiallyRejected),
            (Committed | PartiallyRejected, Finish) => Ok(Idle),
            (state, _) if state.is_active() => Err(Error::Busy(state)),
            (state, event) => Err(Error::Transition { state, event }),
        }
    }
}

/// Correction cycle transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleEvent {
    /// Wavefront errors were submitted
    Collect,
    /// The wavefront error submission failed and nothing was collected
    Discard,
    /// A correction was requested
    Compute,
    /// The correction was computed
    Issue,
    /// The computation or the transmission failed
    Abort,
    /// All issued commands were accepted
    Commit,
    /// Some issued commands were rejected
    PartialReject,
    /// The cycle outcome was recorded
    Finish,
    Reset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nominal_cycle() {
        let state = [
            CycleEvent::Collect,
            CycleEvent::Collect,
            CycleEvent::Compute,
            CycleEvent::Issue,
            CycleEvent::Commit,
            CycleEvent::Finish,
        ]
        .into_iter()
        .try_fold(CycleState::Idle, |state, event| state.next(event))
        .unwrap();
        assert_eq!(state, CycleState::Idle);
    }

    #[test]
    fn test_partial_rejection_returns_to_idle() {
        let state = CycleState::Issuing.next(CycleEvent::PartialReject).unwrap();
        assert_eq!(state, CycleState::PartiallyRejected);
        assert_eq!(state.next(CycleEvent::Finish).unwrap(), CycleState::Idle);
    }

    #[test]
    fn test_active_cycle_is_busy() {
        for state in [CycleState::Computing, CycleState::Issuing] {
            assert!(matches!(state.next(CycleEvent::Compute), Err(Error::Busy(s)) if s == state));
            assert!(matches!(state.next(CycleEvent::Collect), Err(Error::Busy(_))));
            assert_eq!(state.next(CycleEvent::Abort).unwrap(), CycleState::Idle);
        }
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(matches!(
            CycleState::Idle.next(CycleEvent::Compute),
            Err(Error::Transition { .. })
        ));
        assert!(CycleState::Committed.next(CycleEvent::Collect).is_err());
        assert!(CycleState::Idle.next(CycleEvent::Finish).is_err());
    }

    #[test]
    fn test_reset_from_anywhere() {
        for state in [
            CycleState::Idle,
            CycleState::Collecting,
            CycleState::Computing,
            CycleState::Issuing,
            CycleState::Committed,
            CycleState::PartiallyRejected,
        ] {
            assert_eq!(state.next(CycleEvent::Reset).unwrap(), CycleState::Idle);
        }
    }
}
