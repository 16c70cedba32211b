//! Compare-and-set transitions on [`CallSession`].
//!
//! The registry serializes mutations per call id; these helpers are what runs
//! inside that critical section. Every transition names the statuses it expects
//! to start from, so the first of two racing requests wins and the loser gets
//! an [`InvalidTransition`] instead of overwriting the winner.

use chrono::{DateTime, Utc};

use crate::error::InvalidTransition;
use crate::types::{CallSession, EndReason, ParticipantStatus, SessionStatus, UserId};

impl CallSession {
    /// Move to `next` if the current status is one of `expected` and the edge exists.
    pub fn compare_and_set(
        &mut self,
        expected: &[SessionStatus],
        next: SessionStatus,
    ) -> Result<SessionStatus, InvalidTransition> {
        let current = self.status;
        if !expected.contains(&current) || !current.can_transition_to(next, self.kind) {
            return Err(InvalidTransition::status(current, next));
        }
        self.status = next;
        Ok(current)
    }

    /// `Accepted -> Connected`, stamping the connection time used for the duration.
    pub fn mark_connected(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.compare_and_set(&[SessionStatus::Accepted], SessionStatus::Connected)?;
        self.connected_at = Some(now);
        Ok(())
    }

    /// Move into a terminal status from any non-terminal one.
    ///
    /// `duration_seconds` is only computed for `Ended` sessions that reached `Connected`.
    pub fn finish(
        &mut self,
        terminal: SessionStatus,
        reason: Option<EndReason>,
        now: DateTime<Utc>,
    ) -> Result<SessionStatus, InvalidTransition> {
        self.finish_from(
            &[
                SessionStatus::Calling,
                SessionStatus::Ringing,
                SessionStatus::Accepted,
                SessionStatus::Connected,
            ],
            terminal,
            reason,
            now,
        )
    }

    /// Like [`finish`](Self::finish) but only from the listed statuses.
    pub fn finish_from(
        &mut self,
        expected: &[SessionStatus],
        terminal: SessionStatus,
        reason: Option<EndReason>,
        now: DateTime<Utc>,
    ) -> Result<SessionStatus, InvalidTransition> {
        debug_assert!(terminal.is_terminal());
        let previous = self.compare_and_set(expected, terminal)?;
        self.ended_at = Some(now);
        self.reason = reason;
        if terminal == SessionStatus::Ended
            && let Some(connected_at) = self.connected_at
        {
            self.duration_seconds = Some(now.signed_duration_since(connected_at).num_seconds());
        }
        Ok(previous)
    }

    /// Update one participant's sub-state if it is currently in one of `expected`.
    pub fn set_participant_status(
        &mut self,
        user: &UserId,
        expected: &[ParticipantStatus],
        next: ParticipantStatus,
        now: DateTime<Utc>,
    ) -> Result<ParticipantStatus, InvalidTransition> {
        let session_status = self.status;
        let participant = self.participant_mut(user).ok_or_else(|| InvalidTransition {
            current_state: format!("{user} not in call"),
            attempted: format!("{next:?}"),
        })?;
        if session_status.is_terminal() || !expected.contains(&participant.status) {
            return Err(InvalidTransition {
                current_state: format!("{:?} (session {session_status})", participant.status),
                attempted: format!("{next:?}"),
            });
        }
        let previous = participant.status;
        participant.status = next;
        if next == ParticipantStatus::Accepted {
            participant.joined_at = Some(now);
        }
        Ok(previous)
    }
}
