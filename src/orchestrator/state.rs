//! Run lifecycle.

use crate::error::Error;

/// Where a verification run is in its lifecycle.
///
/// ```text
/// Uninitialized -> DatabaseProvisioned -> ExtensionEnabled -> Ready
/// Ready -> SnapshotBefore -> ApplyUp -> Verify -> ApplyDown -> VerifyRollback
/// VerifyRollback -> ApplyUp -> Verify -> Ready
/// Ready -> DatabaseProvisioned            (fresh database for the full chain)
/// <any> -> TearDown
/// ```
///
/// Every per-migration state may fall back to `Ready` when a step fails, so
/// the next migration still gets verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Uninitialized,
    DatabaseProvisioned,
    ExtensionEnabled,
    Ready,
    SnapshotBefore,
    ApplyUp,
    Verify,
    ApplyDown,
    VerifyRollback,
    TearDown,
}

impl RunState {
    fn is_migration_step(self) -> bool {
        matches!(
            self,
            RunState::SnapshotBefore
                | RunState::ApplyUp
                | RunState::Verify
                | RunState::ApplyDown
                | RunState::VerifyRollback
        )
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        if self == TearDown {
            return false;
        }
        if next == TearDown {
            return true;
        }
        if next == Ready && self.is_migration_step() {
            return true;
        }
        matches!(
            (self, next),
            (Uninitialized, DatabaseProvisioned)
                | (DatabaseProvisioned, ExtensionEnabled)
                | (DatabaseProvisioned, Ready)
                | (ExtensionEnabled, Ready)
                | (Ready, SnapshotBefore)
                | (Ready, DatabaseProvisioned)
                | (SnapshotBefore, ApplyUp)
                | (ApplyUp, Verify)
                | (Verify, ApplyDown)
                | (ApplyDown, VerifyRollback)
                | (VerifyRollback, ApplyUp)
        )
    }
}

/// Tracks the current [`RunState`] and rejects illegal transitions.
#[derive(Debug)]
pub struct StateMachine {
    current: RunState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: RunState::Uninitialized,
        }
    }

    pub fn current(&self) -> RunState {
        self.current
    }

    pub fn advance(&mut self, next: RunState) -> Result<(), Error> {
        if !self.current.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.current,
                to: next,
            });
        }
        log::trace!("run state {:?} -> {:?}", self.current, next);
        self.current = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::RunState::*;

    fn walk(machine: &mut StateMachine, states: &[RunState]) {
        for state in states {
            machine.advance(*state).unwrap();
        }
    }

    #[test]
    fn test_full_lifecycle() {
        let mut machine = StateMachine::new();
        walk(&mut machine, &[DatabaseProvisioned, ExtensionEnabled, Ready]);
        // one migration: rollback cycle then idempotency
        walk(
            &mut machine,
            &[SnapshotBefore, ApplyUp, Verify, ApplyDown, VerifyRollback, ApplyUp, Verify, Ready],
        );
        // fresh database, one full-chain step
        walk(&mut machine, &[DatabaseProvisioned, ExtensionEnabled, Ready]);
        walk(&mut machine, &[SnapshotBefore, ApplyUp, Verify, Ready, TearDown]);
        assert_eq!(machine.current(), TearDown);
    }

    #[test]
    fn test_extension_step_is_optional() {
        let mut machine = StateMachine::new();
        walk(&mut machine, &[DatabaseProvisioned, Ready]);
        assert_eq!(machine.current(), Ready);
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let mut machine = StateMachine::new();
        let err = machine.advance(ApplyUp).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: Uninitialized,
                to: ApplyUp
            }
        ));
        assert_eq!(machine.current(), Uninitialized);

        walk(&mut machine, &[DatabaseProvisioned, Ready, SnapshotBefore]);
        assert!(machine.advance(ApplyDown).is_err());
        assert!(machine.advance(DatabaseProvisioned).is_err());
    }

    #[test]
    fn test_failed_step_returns_to_ready() {
        let mut machine = StateMachine::new();
        walk(&mut machine, &[DatabaseProvisioned, Ready, SnapshotBefore, ApplyUp, Ready]);
        assert_eq!(machine.current(), Ready);
    }

    #[test]
    fn test_teardown_is_terminal() {
        let mut machine = StateMachine::new();
        machine.advance(TearDown).unwrap();
        assert!(machine.advance(Ready).is_err());
        assert!(machine.advance(TearDown).is_err());
    }
}
