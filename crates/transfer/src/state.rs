//! Transfer lifecycle transitions.
//!
//! Every state change of a [`TransferRecord`](crate::TransferRecord) goes
//! through [`transition`], so illegal moves are rejected in one place.

use blobxfer_protocol::TransferState;

use crate::error::TransferError;

/// Something that happens to a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// The manager handed the transfer its first chunk.
    Dispatch,
    Pause,
    /// Explicit resume. Without a registered owner the transfer fails.
    Resume { owner_registered: bool },
    /// Reload after restart: any resumable state is queued again.
    Restore,
    /// All chunks done (and, for uploads, the block list committed).
    Finish,
    Fail,
    Cancel,
    Remove,
}

impl StateEvent {
    fn action(self) -> &'static str {
        match self {
            Self::Dispatch => "dispatch",
            Self::Pause => "pause",
            Self::Resume { .. } => "resume",
            Self::Restore => "restore",
            Self::Finish => "finish",
            Self::Fail => "fail",
            Self::Cancel => "cancel",
            Self::Remove => "remove",
        }
    }
}

/// Computes the state that follows `event` in `state`.
pub fn transition(state: TransferState, event: StateEvent) -> Result<TransferState, TransferError> {
    use TransferState::*;

    let next = match (state, event) {
        (Pending | InProgress, StateEvent::Dispatch) => Some(InProgress),
        (Pending | InProgress, StateEvent::Pause) => Some(Paused),
        (Paused | Failed, StateEvent::Resume { owner_registered }) => {
            Some(if owner_registered { Pending } else { Failed })
        }
        (s, StateEvent::Restore) if s.is_resumable() => Some(Pending),
        (Pending | InProgress, StateEvent::Finish) => Some(Complete),
        (Pending | InProgress | Paused | Failed, StateEvent::Fail) => Some(Failed),
        (s, StateEvent::Cancel) if !s.is_terminal() => Some(Canceled),
        (_, StateEvent::Remove) => Some(Deleted),
        _ => None,
    };

    next.ok_or(TransferError::InvalidTransition {
        state,
        action: event.action(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use TransferState::*;

    const ALL: [TransferState; 7] = [Pending, InProgress, Paused, Complete, Failed, Canceled, Deleted];

    #[test]
    fn happy_path() {
        let s = transition(Pending, StateEvent::Dispatch).unwrap();
        assert_eq!(s, InProgress);
        assert_eq!(transition(s, StateEvent::Finish).unwrap(), Complete);
    }

    #[test]
    fn pause_and_resume() {
        assert_eq!(transition(InProgress, StateEvent::Pause).unwrap(), Paused);
        assert_eq!(
            transition(
                Paused,
                StateEvent::Resume {
                    owner_registered: true
                }
            )
            .unwrap(),
            Pending
        );
        assert!(transition(Paused, StateEvent::Pause).is_err());
        assert!(transition(Complete, StateEvent::Pause).is_err());
    }

    #[test]
    fn resume_without_owner_fails_the_transfer() {
        assert_eq!(
            transition(
                Paused,
                StateEvent::Resume {
                    owner_registered: false
                }
            )
            .unwrap(),
            Failed
        );
    }

    #[test]
    fn failed_transfers_can_resume() {
        assert_eq!(
            transition(
                Failed,
                StateEvent::Resume {
                    owner_registered: true
                }
            )
            .unwrap(),
            Pending
        );
    }

    #[test]
    fn terminal_states_stay_terminal() {
        for terminal in [Complete, Canceled, Deleted] {
            for event in [
                StateEvent::Dispatch,
                StateEvent::Pause,
                StateEvent::Resume {
                    owner_registered: true,
                },
                StateEvent::Restore,
                StateEvent::Finish,
                StateEvent::Fail,
                StateEvent::Cancel,
            ] {
                assert!(
                    transition(terminal, event).is_err(),
                    "{terminal} accepted {event:?}"
                );
            }
        }
    }

    #[test]
    fn remove_is_always_allowed() {
        for s in ALL {
            assert_eq!(transition(s, StateEvent::Remove).unwrap(), Deleted);
        }
    }

    #[test]
    fn restore_requeues_resumable_states() {
        for s in [Pending, InProgress, Paused, Failed] {
            assert_eq!(transition(s, StateEvent::Restore).unwrap(), Pending);
        }
    }

    #[test]
    fn invalid_transition_reports_action() {
        let err = transition(Complete, StateEvent::Cancel).unwrap_err();
        assert_eq!(err.to_string(), "cannot cancel a transfer in state Complete");
    }
}
