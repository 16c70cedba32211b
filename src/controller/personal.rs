use callcore::CallError;
use callcore::api::{AnswerPersonal, EndPersonal, InvitePersonal, InviteReceipt};
use callcore::events::SignalEvent;
use callcore::fsm::{ActiveCall, ControllerState, Dialed, Input, Phase};
use callcore::types::{
    CallId, CallKind, CallType, EndReason, ParticipantStatus, ParticipantSummary, UserId,
};
use log::{info, warn};
use std::sync::Arc;

use super::CallObserver;
use super::runner::ControllerCore;
use crate::config::CallConfig;
use crate::media::MediaSessionManager;
use crate::signaling::SignalingClient;

/// One-to-one calls for a single signed-in user.
#[derive(Debug)]
pub struct PersonalCallController {
    core: Arc<ControllerCore>,
}

/// The call `call_id` if it is the one ringing us right now.
fn ringing<'a>(state: &'a ControllerState, call_id: &CallId) -> Result<&'a ActiveCall, CallError> {
    let call = state
        .call
        .as_ref()
        .filter(|c| &c.call_id == call_id)
        .ok_or_else(|| CallError::NotFound(format!("call {call_id}")))?;
    if call.phase != Phase::Ringing {
        return Err(CallError::conflict(format!("{:?}", call.phase), "answer"));
    }
    Ok(call)
}

impl PersonalCallController {
    pub fn new(
        config: &CallConfig,
        signaling: Arc<dyn SignalingClient>,
        media: Arc<MediaSessionManager>,
        observer: Arc<dyn CallObserver>,
    ) -> Self {
        Self {
            core: ControllerCore::new(CallKind::Personal, config, signaling, media, observer),
        }
    }

    pub fn user_id(&self) -> &UserId {
        self.core.user()
    }

    pub fn media(&self) -> &Arc<MediaSessionManager> {
        self.core.media()
    }

    pub async fn state(&self) -> ControllerState {
        self.core.snapshot().await
    }

    pub async fn current_call(&self) -> Option<ActiveCall> {
        self.core.snapshot().await.call
    }

    /// The call whose ring countdown is running, if any.
    pub fn countdown_armed(&self) -> Option<CallId> {
        self.core.countdown_armed()
    }

    /// Re-reads the current call from the registry and finishes it locally if
    /// it already ended there. Returns whether local state changed.
    pub async fn resync(&self) -> bool {
        self.core.resync().await
    }

    pub(crate) async fn handle_signal(&self, event: SignalEvent) -> bool {
        self.core.apply(Input::Signal(event)).await
    }

    pub async fn invite(
        &self,
        callee: UserId,
        call_type: CallType,
    ) -> Result<InviteReceipt, CallError> {
        let mut state = self.core.lock().await;
        if !state.is_idle() {
            return Err(CallError::Busy(self.user_id().clone()));
        }
        let receipt = self
            .core
            .signaling()
            .invite_personal(InvitePersonal {
                callee_id: callee.clone(),
                call_type,
            })
            .await?;
        let me = ParticipantSummary {
            id: self.user_id().clone(),
            name: self.user_id().to_string(),
            status: ParticipantStatus::Accepted,
        };
        let peer = ParticipantSummary {
            name: callee.to_string(),
            id: callee,
            status: ParticipantStatus::Calling,
        };
        self.core
            .apply_locked(
                &mut state,
                Input::Dialed(Dialed {
                    call_id: receipt.call_id.clone(),
                    channel: receipt.channel.clone(),
                    call_type,
                    group_id: None,
                    peer: Some(peer.clone()),
                    participants: vec![me, peer],
                }),
            )
            .await;
        Ok(receipt)
    }

    pub async fn accept(&self, call_id: &CallId) -> Result<(), CallError> {
        self.answer(call_id, true, None).await
    }

    pub async fn reject(&self, call_id: &CallId, reason: Option<EndReason>) -> Result<(), CallError> {
        self.answer(call_id, false, reason.or(Some(EndReason::Declined)))
            .await
    }

    async fn answer(
        &self,
        call_id: &CallId,
        accepted: bool,
        reason: Option<EndReason>,
    ) -> Result<(), CallError> {
        let mut state = self.core.lock().await;
        let caller_id = ringing(&state, call_id)?
            .peer
            .as_ref()
            .map(|p| p.id.clone())
            .ok_or_else(|| CallError::Validation("incoming call without a caller".into()))?;

        let answered = self
            .core
            .signaling()
            .answer_personal(AnswerPersonal {
                call_id: call_id.clone(),
                caller_id,
                accepted,
                reason,
            })
            .await;
        match answered {
            Ok(()) => {
                self.core
                    .apply_locked(
                        &mut state,
                        Input::Answered {
                            call_id: call_id.clone(),
                            accepted,
                        },
                    )
                    .await;
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                info!("call {} moved on before our answer: {}", call_id, e);
                self.core
                    .apply_locked(
                        &mut state,
                        Input::HungUp {
                            call_id: call_id.clone(),
                        },
                    )
                    .await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Ends whatever call is current: declines a ring, otherwise ends the call
    /// for both sides. Local state is reset even if the registry disagrees.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        let mut state = self.core.lock().await;
        let Some(call) = state.call.clone() else {
            return Ok(());
        };
        let signaling = self.core.signaling();
        let (result, input) = if call.phase == Phase::Ringing {
            let caller_id = call
                .peer
                .as_ref()
                .map(|p| p.id.clone())
                .unwrap_or_else(|| self.user_id().clone());
            let result = signaling
                .answer_personal(AnswerPersonal {
                    call_id: call.call_id.clone(),
                    caller_id,
                    accepted: false,
                    reason: Some(EndReason::Declined),
                })
                .await;
            let input = Input::Answered {
                call_id: call.call_id.clone(),
                accepted: false,
            };
            (result, input)
        } else {
            let result = signaling
                .end_personal(EndPersonal {
                    call_id: call.call_id.clone(),
                    participant_ids: call.participants.iter().map(|p| p.id.clone()).collect(),
                    reason: Some(EndReason::Hangup),
                })
                .await;
            (
                result,
                Input::HungUp {
                    call_id: call.call_id.clone(),
                },
            )
        };

        self.core.apply_locked(&mut state, input).await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => {
                warn!("hang up of {} not confirmed by the registry: {}", call.call_id, e);
                Err(e)
            }
        }
    }

    /// Withdraws our own unanswered invite.
    pub async fn cancel(&self) -> Result<(), CallError> {
        let mut state = self.core.lock().await;
        let Some(call) = state.call.clone() else {
            return Ok(());
        };
        if call.phase != Phase::Dialing {
            return Err(CallError::conflict(format!("{:?}", call.phase), "cancel"));
        }
        let result = self.core.signaling().cancel_personal(&call.call_id).await;
        self.core
            .apply_locked(
                &mut state,
                Input::HungUp {
                    call_id: call.call_id.clone(),
                },
            )
            .await;
        match result {
            Err(e) if !e.is_conflict() => Err(e),
            _ => Ok(()),
        }
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.core.media().set_muted(muted).await
    }
}
