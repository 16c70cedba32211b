//! Core call data model shared by the registry and the client controllers.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

// Macro to generate the opaque string identifier newtypes.
macro_rules! define_id {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(String);

            impl $name {
                pub fn new(value: impl Into<String>) -> Self {
                    Self(value.into())
                }

                pub fn as_str(&self) -> &str {
                    &self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl From<&str> for $name {
                fn from(value: &str) -> Self {
                    Self(value.to_string())
                }
            }

            impl From<String> for $name {
                fn from(value: String) -> Self {
                    Self(value)
                }
            }
        )*
    };
}

define_id! {
    /// Chat user identifier. Authentication is external; this is trusted as given.
    UserId,
    /// Globally unique call session identifier.
    CallId,
    /// Chat group identifier.
    GroupId,
    /// Media room identifier, unique per session and never reused.
    ChannelId,
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill(buf.as_mut_slice());
    hex::encode_upper(buf)
}

impl CallId {
    /// 32 hex characters, same shape as the ids the chat backend hands out.
    pub fn generate() -> Self {
        Self(random_hex(16))
    }
}

impl ChannelId {
    pub fn generate(kind: CallKind) -> Self {
        let prefix = match kind {
            CallKind::Personal => "p",
            CallKind::Group => "g",
        };
        Self(format!("{prefix}-{}", random_hex(12).to_lowercase()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallKind {
    Personal,
    Group,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallKind::Personal => f.write_str("personal"),
            CallKind::Group => f.write_str("group"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallType {
    #[default]
    Voice,
    Video,
}

/// Session-level status. `Rejected`, `Cancelled`, `Missed` and `Ended` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Calling,
    Ringing,
    Accepted,
    Connected,
    Rejected,
    Cancelled,
    Missed,
    Ended,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Cancelled | Self::Missed | Self::Ended
        )
    }

    /// Still waiting for somebody to pick up.
    pub fn is_unanswered(&self) -> bool {
        matches!(self, Self::Calling | Self::Ringing)
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Accepted | Self::Connected)
    }

    /// Whether `self -> next` is an edge of the session state machine for `kind`.
    pub fn can_transition_to(&self, next: SessionStatus, kind: CallKind) -> bool {
        use SessionStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (kind, self, next) {
            (CallKind::Personal, Calling, Ringing) => true,
            (_, Calling | Ringing, Accepted | Cancelled | Missed | Ended) => true,
            (CallKind::Personal, Calling | Ringing, Rejected) => true,
            (_, Accepted, Connected | Ended) => true,
            (_, Connected, Ended) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Calling => "calling",
            Self::Ringing => "ringing",
            Self::Accepted => "accepted",
            Self::Connected => "connected",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Missed => "missed",
            Self::Ended => "ended",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParticipantRole {
    Initiator,
    Invitee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParticipantStatus {
    Calling,
    Ringing,
    Accepted,
    Rejected,
    Left,
    Recalled,
}

impl ParticipantStatus {
    /// Being rung right now (a notification should be pending).
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Calling | Self::Ringing | Self::Recalled)
    }

    /// Recall is allowed for members who are not currently in the call.
    pub fn is_recallable(&self) -> bool {
        matches!(self, Self::Calling | Self::Ringing | Self::Rejected | Self::Left)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    pub role: ParticipantRole,
    pub status: ParticipantStatus,
    pub joined_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn initiator(user_id: UserId, display_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            role: ParticipantRole::Initiator,
            status: ParticipantStatus::Accepted,
            joined_at: Some(now),
        }
    }

    pub fn invitee(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            role: ParticipantRole::Invitee,
            status: ParticipantStatus::Calling,
            joined_at: None,
        }
    }

    pub fn summary(&self) -> ParticipantSummary {
        ParticipantSummary {
            id: self.user_id.clone(),
            name: self.display_name.clone(),
            status: self.status,
        }
    }
}

/// Roster entry as exposed in invite receipts and events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub id: UserId,
    pub name: String,
    pub status: ParticipantStatus,
}

/// Why a session reached its terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    Hangup,
    Declined,
    Busy,
    Timeout,
    Cancelled,
    Left,
    Other(String),
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hangup => f.write_str("hangup"),
            Self::Declined => f.write_str("declined"),
            Self::Busy => f.write_str("busy"),
            Self::Timeout => f.write_str("timeout"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Left => f.write_str("left"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

/// Full server-side record of one call attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    pub id: CallId,
    pub kind: CallKind,
    pub call_type: CallType,
    pub status: SessionStatus,
    pub channel: ChannelId,
    pub group_id: Option<GroupId>,
    pub participants: Vec<Participant>,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub reason: Option<EndReason>,
    pub duration_seconds: Option<i64>,
}

impl CallSession {
    pub fn new_personal(
        caller: Participant,
        callee: Participant,
        call_type: CallType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CallId::generate(),
            kind: CallKind::Personal,
            call_type,
            status: SessionStatus::Calling,
            channel: ChannelId::generate(CallKind::Personal),
            group_id: None,
            participants: vec![caller, callee],
            created_at: now,
            connected_at: None,
            ended_at: None,
            reason: None,
            duration_seconds: None,
        }
    }

    pub fn new_group(
        group_id: GroupId,
        participants: Vec<Participant>,
        call_type: CallType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CallId::generate(),
            kind: CallKind::Group,
            call_type,
            status: SessionStatus::Calling,
            channel: ChannelId::generate(CallKind::Group),
            group_id: Some(group_id),
            participants,
            created_at: now,
            connected_at: None,
            ended_at: None,
            reason: None,
            duration_seconds: None,
        }
    }

    pub fn participant(&self, user: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.user_id == user)
    }

    pub fn participant_mut(&mut self, user: &UserId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| &p.user_id == user)
    }

    pub fn is_participant(&self, user: &UserId) -> bool {
        self.participant(user).is_some()
    }

    pub fn initiator(&self) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.role == ParticipantRole::Initiator)
    }

    pub fn is_initiator(&self, user: &UserId) -> bool {
        self.initiator().is_some_and(|p| &p.user_id == user)
    }

    pub fn invitees(&self) -> impl Iterator<Item = &Participant> {
        self.participants
            .iter()
            .filter(|p| p.role == ParticipantRole::Invitee)
    }

    pub fn participant_ids(&self) -> Vec<UserId> {
        self.participants.iter().map(|p| p.user_id.clone()).collect()
    }

    pub fn roster(&self) -> Vec<ParticipantSummary> {
        self.participants.iter().map(Participant::summary).collect()
    }

    /// Any invitee (not counting the auto-accepted group initiator) has accepted.
    pub fn has_accepted_invitee(&self) -> bool {
        self.invitees()
            .any(|p| p.status == ParticipantStatus::Accepted)
    }

    pub fn accepted_count(&self) -> usize {
        self.participants
            .iter()
            .filter(|p| p.status == ParticipantStatus::Accepted)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_have_no_outgoing_edges() {
        use SessionStatus::*;
        let all = [
            Calling, Ringing, Accepted, Connected, Rejected, Cancelled, Missed, Ended,
        ];
        for from in [Rejected, Cancelled, Missed, Ended] {
            for to in all {
                assert!(!from.can_transition_to(to, CallKind::Personal));
                assert!(!from.can_transition_to(to, CallKind::Group));
            }
        }
    }

    #[test]
    fn group_sessions_cannot_be_rejected_or_ring() {
        assert!(!SessionStatus::Calling.can_transition_to(SessionStatus::Rejected, CallKind::Group));
        assert!(!SessionStatus::Calling.can_transition_to(SessionStatus::Ringing, CallKind::Group));
        assert!(SessionStatus::Calling.can_transition_to(SessionStatus::Ringing, CallKind::Personal));
    }

    #[test]
    fn connected_only_after_accepted() {
        assert!(!SessionStatus::Calling.can_transition_to(SessionStatus::Connected, CallKind::Personal));
        assert!(SessionStatus::Accepted.can_transition_to(SessionStatus::Connected, CallKind::Personal));
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = CallId::generate();
        let b = CallId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(ChannelId::generate(CallKind::Group).as_str().starts_with("g-"));
    }

    #[test]
    fn status_serializes_kebab_case() {
        let json = serde_json::to_string(&SessionStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        let reason = serde_json::to_string(&EndReason::Timeout).unwrap();
        assert_eq!(reason, "\"timeout\"");
    }
}
