use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{CallId, CallKind, UserId};

/// Identifies one pending "incoming call" notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationKey {
    pub call_id: CallId,
    pub kind: CallKind,
    pub user_id: UserId,
}

impl NotificationKey {
    pub fn new(call_id: CallId, kind: CallKind, user_id: UserId) -> Self {
        Self {
            call_id,
            kind,
            user_id,
        }
    }
}

impl fmt::Display for NotificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.call_id, self.user_id)
    }
}

/// Payload shown to the recipient while the ticket is pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingCallNotice {
    pub caller_name: String,
    pub group_name: Option<String>,
}
