//! Request and response shapes of the signaling RPCs.
//!
//! These are plain data; the wire format is whatever the embedding transport
//! chooses (the in-process adapter passes them by value).

use serde::{Deserialize, Serialize};

use crate::error::CallError;
use crate::types::{
    CallId, CallType, ChannelId, EndReason, GroupId, ParticipantSummary, SessionStatus, UserId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitePersonal {
    pub callee_id: UserId,
    pub call_type: CallType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteReceipt {
    pub call_id: CallId,
    pub channel: ChannelId,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPersonal {
    pub call_id: CallId,
    /// The original caller, echoed back so the registry can route `call-accepted`.
    pub caller_id: UserId,
    pub accepted: bool,
    pub reason: Option<EndReason>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndPersonal {
    pub call_id: CallId,
    pub participant_ids: Vec<UserId>,
    pub reason: Option<EndReason>,
}

/// Client-side countdown expired without an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissedReport {
    pub call_id: CallId,
    pub group_id: Option<GroupId>,
    pub reason: EndReason,
}

impl MissedReport {
    pub fn timeout(call_id: CallId, group_id: Option<GroupId>) -> Self {
        Self {
            call_id,
            group_id,
            reason: EndReason::Timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteGroup {
    pub group_id: GroupId,
    pub call_type: CallType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInviteReceipt {
    pub call_id: CallId,
    pub channel: ChannelId,
    pub group: GroupId,
    pub participants: Vec<ParticipantSummary>,
}

/// Target of the group answer/end/cancel/leave/join operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupCallRef {
    pub call_id: CallId,
    pub group_id: GroupId,
}

impl GroupCallRef {
    pub fn new(call_id: CallId, group_id: GroupId) -> Self {
        Self { call_id, group_id }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerGroup {
    pub call: GroupCallRef,
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecallParticipant {
    pub call: GroupCallRef,
    pub target: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTokenRequest {
    pub channel: ChannelId,
    pub uid: u32,
}

/// Join credential for the media transport. `token` is `None` in permissive mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaCredential {
    pub app_id: String,
    pub token: Option<String>,
    pub uid: u32,
}

impl InvitePersonal {
    pub fn validate(&self, caller: &UserId) -> Result<(), CallError> {
        if self.callee_id.as_str().is_empty() {
            return Err(CallError::Validation("callee id is empty".into()));
        }
        if &self.callee_id == caller {
            return Err(CallError::Validation("cannot call yourself".into()));
        }
        Ok(())
    }
}

impl EndPersonal {
    pub fn validate(&self) -> Result<(), CallError> {
        if self.participant_ids.is_empty() {
            return Err(CallError::Validation("participant list is empty".into()));
        }
        Ok(())
    }
}

impl MediaTokenRequest {
    pub fn validate(&self) -> Result<(), CallError> {
        if self.channel.as_str().is_empty() {
            return Err(CallError::Validation("channel is empty".into()));
        }
        if self.uid == 0 {
            return Err(CallError::Validation("uid 0 is reserved".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_call_is_rejected() {
        let me = UserId::new("alice");
        let req = InvitePersonal {
            callee_id: me.clone(),
            call_type: CallType::Voice,
        };
        assert!(matches!(req.validate(&me), Err(CallError::Validation(_))));
    }

    #[test]
    fn media_token_request_checks_uid() {
        let req = MediaTokenRequest {
            channel: ChannelId::new("p-1"),
            uid: 0,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn credential_token_is_nullable() {
        let cred = MediaCredential {
            app_id: "app".into(),
            token: None,
            uid: 5,
        };
        let value = serde_json::to_value(&cred).unwrap();
        assert!(value["token"].is_null());
    }
}
