//! Client side of the signaling RPCs.
//!
//! Controllers only see [`SignalingClient`] and [`CredentialSource`]; the
//! [`InProcessSignaling`] adapter binds one user identity to a
//! [`CallRegistry`] and a [`SignalBus`] living in the same process.

use async_trait::async_trait;
use callcore::CallError;
use callcore::api::{
    AnswerGroup, AnswerPersonal, EndPersonal, GroupCallRef, GroupInviteReceipt, InviteGroup,
    InvitePersonal, InviteReceipt, MediaCredential, MediaTokenRequest, MissedReport,
    RecallParticipant,
};
use callcore::events::{Envelope, Topic};
use callcore::types::{CallId, CallSession, ChannelId, UserId};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::bus::SignalBus;
use crate::registry::CallRegistry;

#[async_trait]
pub trait SignalingClient: Send + Sync {
    /// The identity every request is made as.
    fn user_id(&self) -> &UserId;

    fn subscribe(&self, topic: &Topic) -> broadcast::Receiver<Envelope>;

    async fn invite_personal(&self, req: InvitePersonal) -> Result<InviteReceipt, CallError>;
    async fn ring_personal(&self, call_id: &CallId) -> Result<(), CallError>;
    async fn answer_personal(&self, req: AnswerPersonal) -> Result<(), CallError>;
    async fn end_personal(&self, req: EndPersonal) -> Result<(), CallError>;
    async fn cancel_personal(&self, call_id: &CallId) -> Result<(), CallError>;
    async fn report_missed(&self, req: MissedReport) -> Result<(), CallError>;
    async fn report_connected(&self, call_id: &CallId) -> Result<(), CallError>;

    async fn invite_group(&self, req: InviteGroup) -> Result<GroupInviteReceipt, CallError>;
    async fn ring_group(&self, call: &GroupCallRef) -> Result<(), CallError>;
    async fn answer_group(&self, req: AnswerGroup) -> Result<(), CallError>;
    async fn end_group(&self, call: &GroupCallRef) -> Result<(), CallError>;
    async fn cancel_group(&self, call: &GroupCallRef) -> Result<(), CallError>;
    async fn leave_group(&self, call: &GroupCallRef) -> Result<(), CallError>;
    async fn join_group(&self, call: &GroupCallRef) -> Result<GroupInviteReceipt, CallError>;
    async fn recall_participant(&self, req: RecallParticipant) -> Result<(), CallError>;

    /// Current registry view of a call this user takes part in.
    async fn session(&self, call_id: &CallId) -> Result<CallSession, CallError>;
}

/// Token endpoint used by the media layer before every join.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn media_credential(
        &self,
        channel: &ChannelId,
        uid: u32,
    ) -> Result<MediaCredential, CallError>;
}

#[derive(Clone)]
pub struct InProcessSignaling {
    user: UserId,
    registry: Arc<CallRegistry>,
    bus: Arc<dyn SignalBus>,
}

impl std::fmt::Debug for InProcessSignaling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessSignaling")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl InProcessSignaling {
    pub fn new(user: UserId, registry: Arc<CallRegistry>, bus: Arc<dyn SignalBus>) -> Self {
        Self {
            user,
            registry,
            bus,
        }
    }

    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }
}

#[async_trait]
impl SignalingClient for InProcessSignaling {
    fn user_id(&self) -> &UserId {
        &self.user
    }

    fn subscribe(&self, topic: &Topic) -> broadcast::Receiver<Envelope> {
        self.bus.subscribe(topic)
    }

    async fn invite_personal(&self, req: InvitePersonal) -> Result<InviteReceipt, CallError> {
        self.registry.create_personal(&self.user, req).await
    }

    async fn ring_personal(&self, call_id: &CallId) -> Result<(), CallError> {
        self.registry.ring_personal(&self.user, call_id).await
    }

    async fn answer_personal(&self, req: AnswerPersonal) -> Result<(), CallError> {
        self.registry.answer_personal(&self.user, req).await
    }

    async fn end_personal(&self, req: EndPersonal) -> Result<(), CallError> {
        self.registry.end_call(&self.user, req).await
    }

    async fn cancel_personal(&self, call_id: &CallId) -> Result<(), CallError> {
        self.registry.cancel_personal(&self.user, call_id).await
    }

    async fn report_missed(&self, req: MissedReport) -> Result<(), CallError> {
        self.registry.report_missed(&self.user, req).await
    }

    async fn report_connected(&self, call_id: &CallId) -> Result<(), CallError> {
        self.registry.report_connected(&self.user, call_id).await
    }

    async fn invite_group(&self, req: InviteGroup) -> Result<GroupInviteReceipt, CallError> {
        self.registry.create_group(&self.user, req).await
    }

    async fn ring_group(&self, call: &GroupCallRef) -> Result<(), CallError> {
        self.registry.ring_group(&self.user, call).await
    }

    async fn answer_group(&self, req: AnswerGroup) -> Result<(), CallError> {
        self.registry.answer_group(&self.user, req).await
    }

    async fn end_group(&self, call: &GroupCallRef) -> Result<(), CallError> {
        self.registry.end_group(&self.user, call).await
    }

    async fn cancel_group(&self, call: &GroupCallRef) -> Result<(), CallError> {
        self.registry.cancel_group(&self.user, call).await
    }

    async fn leave_group(&self, call: &GroupCallRef) -> Result<(), CallError> {
        self.registry.leave_group(&self.user, call).await
    }

    async fn join_group(&self, call: &GroupCallRef) -> Result<GroupInviteReceipt, CallError> {
        self.registry.join_group(&self.user, call).await
    }

    async fn recall_participant(&self, req: RecallParticipant) -> Result<(), CallError> {
        self.registry.recall_participant(&self.user, req).await
    }

    async fn session(&self, call_id: &CallId) -> Result<CallSession, CallError> {
        let session = self
            .registry
            .session(call_id)
            .await
            .ok_or_else(|| CallError::NotFound(format!("call {call_id}")))?;
        if !session.is_participant(&self.user) {
            return Err(CallError::unauthorized(call_id, &self.user));
        }
        Ok(session)
    }
}

#[async_trait]
impl CredentialSource for InProcessSignaling {
    async fn media_credential(
        &self,
        channel: &ChannelId,
        uid: u32,
    ) -> Result<MediaCredential, CallError> {
        self.registry
            .media_token(
                &self.user,
                MediaTokenRequest {
                    channel: channel.clone(),
                    uid,
                },
            )
            .await
    }
}
