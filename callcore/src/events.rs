//! Signaling events broadcast by the registry.
//!
//! Each event name is its own variant so controllers can match exhaustively.
//! Delivery is at-least-once and unordered, so every variant carries the
//! `call_id` consumers need to validate it against their local state.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{
    CallId, CallKind, CallSession, CallType, ChannelId, EndReason, GroupId, ParticipantRole,
    ParticipantStatus, ParticipantSummary, SessionStatus, UserId,
};

/// Fan-out destination on the signaling bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "kebab-case")]
pub enum Topic {
    User(UserId),
    Group(GroupId),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::User(id) => write!(f, "user.{id}"),
            Topic::Group(id) => write!(f, "group.{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SignalEvent {
    // Personal calls, delivered on `user.{id}`.
    IncomingCall {
        call_id: CallId,
        caller: ParticipantSummary,
        call_type: CallType,
        channel: ChannelId,
    },
    CallRinging {
        call_id: CallId,
    },
    CallAccepted {
        call_id: CallId,
        by: UserId,
    },
    /// Media-join cue sent to both participants after an accept.
    CallStarted {
        call_id: CallId,
        channel: ChannelId,
    },
    CallRejected {
        call_id: CallId,
        by: UserId,
        reason: Option<EndReason>,
    },
    CallCancelled {
        call_id: CallId,
    },
    CallMissed {
        call_id: CallId,
    },
    CallEnded {
        call_id: CallId,
        ended_by: Option<UserId>,
        reason: Option<EndReason>,
        duration_seconds: Option<i64>,
    },

    // Group ring, delivered on `user.{id}` of each invitee (or one recalled user).
    GroupIncomingCall {
        call_id: CallId,
        group_id: GroupId,
        initiator: ParticipantSummary,
        call_type: CallType,
        channel: ChannelId,
        participants: Vec<ParticipantSummary>,
    },

    // Group lifecycle, delivered on `group.{id}`.
    GroupCallAnswered {
        call_id: CallId,
        group_id: GroupId,
        user_id: UserId,
        accepted: bool,
    },
    GroupParticipantJoined {
        call_id: CallId,
        group_id: GroupId,
        user_id: UserId,
    },
    GroupParticipantLeft {
        call_id: CallId,
        group_id: GroupId,
        user_id: UserId,
    },
    GroupParticipantRecalled {
        call_id: CallId,
        group_id: GroupId,
        user_id: UserId,
        by: UserId,
    },
    GroupCallCancelled {
        call_id: CallId,
        group_id: GroupId,
        reason: Option<EndReason>,
    },
    GroupCallMissed {
        call_id: CallId,
        group_id: GroupId,
    },
    GroupCallEnded {
        call_id: CallId,
        group_id: GroupId,
        ended_by: Option<UserId>,
        reason: Option<EndReason>,
        duration_seconds: Option<i64>,
    },
}

impl SignalEvent {
    pub fn call_id(&self) -> &CallId {
        match self {
            Self::IncomingCall { call_id, .. }
            | Self::CallRinging { call_id }
            | Self::CallAccepted { call_id, .. }
            | Self::CallStarted { call_id, .. }
            | Self::CallRejected { call_id, .. }
            | Self::CallCancelled { call_id }
            | Self::CallMissed { call_id }
            | Self::CallEnded { call_id, .. }
            | Self::GroupIncomingCall { call_id, .. }
            | Self::GroupCallAnswered { call_id, .. }
            | Self::GroupParticipantJoined { call_id, .. }
            | Self::GroupParticipantLeft { call_id, .. }
            | Self::GroupParticipantRecalled { call_id, .. }
            | Self::GroupCallCancelled { call_id, .. }
            | Self::GroupCallMissed { call_id, .. }
            | Self::GroupCallEnded { call_id, .. } => call_id,
        }
    }

    /// Wire event name, identical to the serde tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::IncomingCall { .. } => "incoming-call",
            Self::CallRinging { .. } => "call-ringing",
            Self::CallAccepted { .. } => "call-accepted",
            Self::CallStarted { .. } => "call-started",
            Self::CallRejected { .. } => "call-rejected",
            Self::CallCancelled { .. } => "call-cancelled",
            Self::CallMissed { .. } => "call-missed",
            Self::CallEnded { .. } => "call-ended",
            Self::GroupIncomingCall { .. } => "group-incoming-call",
            Self::GroupCallAnswered { .. } => "group-call-answered",
            Self::GroupParticipantJoined { .. } => "group-participant-joined",
            Self::GroupParticipantLeft { .. } => "group-participant-left",
            Self::GroupParticipantRecalled { .. } => "group-participant-recalled",
            Self::GroupCallCancelled { .. } => "group-call-cancelled",
            Self::GroupCallMissed { .. } => "group-call-missed",
            Self::GroupCallEnded { .. } => "group-call-ended",
        }
    }

    /// Group events (including the group ring) belong to the group controller.
    pub fn is_group(&self) -> bool {
        matches!(
            self,
            Self::GroupIncomingCall { .. }
                | Self::GroupCallAnswered { .. }
                | Self::GroupParticipantJoined { .. }
                | Self::GroupParticipantLeft { .. }
                | Self::GroupParticipantRecalled { .. }
                | Self::GroupCallCancelled { .. }
                | Self::GroupCallMissed { .. }
                | Self::GroupCallEnded { .. }
        )
    }

    /// The terminal event the registry would have broadcast for `session`, or
    /// `None` while it is still running. Used to catch up after missed deliveries.
    pub fn terminal_for(session: &CallSession) -> Option<SignalEvent> {
        let call_id = session.id.clone();
        let reason = session.reason.clone();
        let event = match (session.kind, &session.group_id) {
            (CallKind::Group, Some(group_id)) => {
                let group_id = group_id.clone();
                match session.status {
                    SessionStatus::Ended => Self::GroupCallEnded {
                        call_id,
                        group_id,
                        ended_by: None,
                        reason,
                        duration_seconds: session.duration_seconds,
                    },
                    SessionStatus::Missed => Self::GroupCallMissed { call_id, group_id },
                    SessionStatus::Cancelled | SessionStatus::Rejected => Self::GroupCallCancelled {
                        call_id,
                        group_id,
                        reason,
                    },
                    _ => return None,
                }
            }
            // A group session always carries its group.
            (CallKind::Group, None) => return None,
            (CallKind::Personal, _) => match session.status {
                SessionStatus::Ended => Self::CallEnded {
                    call_id,
                    ended_by: None,
                    reason,
                    duration_seconds: session.duration_seconds,
                },
                SessionStatus::Missed => Self::CallMissed { call_id },
                SessionStatus::Cancelled => Self::CallCancelled { call_id },
                SessionStatus::Rejected => {
                    let by = session
                        .participants
                        .iter()
                        .find(|p| p.status == ParticipantStatus::Rejected)
                        .or_else(|| {
                            session
                                .participants
                                .iter()
                                .find(|p| p.role != ParticipantRole::Initiator)
                        })?
                        .user_id
                        .clone();
                    Self::CallRejected {
                        call_id,
                        by,
                        reason,
                    }
                }
                _ => return None,
            },
        };
        Some(event)
    }

    /// The event ends the session for every participant.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CallRejected { .. }
                | Self::CallCancelled { .. }
                | Self::CallMissed { .. }
                | Self::CallEnded { .. }
                | Self::GroupCallCancelled { .. }
                | Self::GroupCallMissed { .. }
                | Self::GroupCallEnded { .. }
        )
    }
}

/// What subscribers actually receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: Topic,
    pub event: SignalEvent,
}

impl Envelope {
    pub fn new(topic: Topic, event: SignalEvent) -> Self {
        Self { topic, event }
    }
}
