use callcore::CallError;
use callcore::api::{AnswerGroup, GroupCallRef, GroupInviteReceipt, InviteGroup, RecallParticipant};
use callcore::events::SignalEvent;
use callcore::fsm::{ActiveCall, ControllerState, Dialed, Input, Phase};
use callcore::types::{CallId, CallKind, CallType, GroupId, ParticipantRole, UserId};
use log::{info, warn};
use std::sync::Arc;

use super::CallObserver;
use super::runner::ControllerCore;
use crate::config::CallConfig;
use crate::media::MediaSessionManager;
use crate::signaling::SignalingClient;

/// Group calls for a single signed-in user.
///
/// Besides the user topic, the controller listens on the topic of every
/// group it has called or been rung from; that subscription is installed once
/// per group and kept for the controller's lifetime.
#[derive(Debug)]
pub struct GroupCallController {
    core: Arc<ControllerCore>,
}

fn call_ref(call: &ActiveCall) -> Result<GroupCallRef, CallError> {
    let group_id = call
        .group_id
        .clone()
        .ok_or_else(|| CallError::Validation(format!("call {} has no group", call.call_id)))?;
    Ok(GroupCallRef::new(call.call_id.clone(), group_id))
}

fn current<'a>(state: &'a ControllerState, call_id: &CallId) -> Result<&'a ActiveCall, CallError> {
    state
        .call
        .as_ref()
        .filter(|c| &c.call_id == call_id)
        .ok_or_else(|| CallError::NotFound(format!("call {call_id}")))
}

impl GroupCallController {
    pub fn new(
        config: &CallConfig,
        signaling: Arc<dyn SignalingClient>,
        media: Arc<MediaSessionManager>,
        observer: Arc<dyn CallObserver>,
    ) -> Self {
        Self {
            core: ControllerCore::new(CallKind::Group, config, signaling, media, observer),
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

    pub fn countdown_armed(&self) -> Option<CallId> {
        self.core.countdown_armed()
    }

    pub fn is_watching(&self, group_id: &GroupId) -> bool {
        self.core.is_watching(group_id)
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
        group_id: GroupId,
        call_type: CallType,
    ) -> Result<GroupInviteReceipt, CallError> {
        let mut state = self.core.lock().await;
        if !state.is_idle() {
            return Err(CallError::Busy(self.user_id().clone()));
        }
        let receipt = self
            .core
            .signaling()
            .invite_group(InviteGroup {
                group_id,
                call_type,
            })
            .await?;
        self.core
            .apply_locked(
                &mut state,
                Input::Dialed(Dialed {
                    call_id: receipt.call_id.clone(),
                    channel: receipt.channel.clone(),
                    call_type,
                    group_id: Some(receipt.group.clone()),
                    peer: None,
                    participants: receipt.participants.clone(),
                }),
            )
            .await;
        Ok(receipt)
    }

    pub async fn accept(&self, call_id: &CallId) -> Result<(), CallError> {
        self.answer(call_id, true).await
    }

    /// Declining only ends the call for us; the others keep ringing.
    pub async fn decline(&self, call_id: &CallId) -> Result<(), CallError> {
        self.answer(call_id, false).await
    }

    async fn answer(&self, call_id: &CallId, accepted: bool) -> Result<(), CallError> {
        let mut state = self.core.lock().await;
        let call = current(&state, call_id)?;
        if call.phase != Phase::Ringing {
            return Err(CallError::conflict(format!("{:?}", call.phase), "answer"));
        }
        let call = call_ref(call)?;
        let answered = self
            .core
            .signaling()
            .answer_group(AnswerGroup {
                call,
                accepted,
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
                info!("group call {} moved on before our answer: {}", call_id, e);
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
            // Busy elsewhere: keep ringing so the user can still decline.
            Err(e) => Err(e),
        }
    }

    /// Leaves the current call the way its phase calls for: declines a ring,
    /// cancels our own unanswered invite, otherwise leaves a running call.
    pub async fn leave(&self) -> Result<(), CallError> {
        let mut state = self.core.lock().await;
        let Some(call) = state.call.clone() else {
            return Ok(());
        };
        let target = call_ref(&call)?;
        let signaling = self.core.signaling();
        let (result, input) = match (call.phase, call.role) {
            (Phase::Ringing, _) => (
                signaling
                    .answer_group(AnswerGroup {
                        call: target,
                        accepted: false,
                    })
                    .await,
                Input::Answered {
                    call_id: call.call_id.clone(),
                    accepted: false,
                },
            ),
            (Phase::Dialing, ParticipantRole::Initiator) => (
                signaling.cancel_group(&target).await,
                Input::HungUp {
                    call_id: call.call_id.clone(),
                },
            ),
            _ => (
                signaling.leave_group(&target).await,
                Input::HungUp {
                    call_id: call.call_id.clone(),
                },
            ),
        };
        self.core.apply_locked(&mut state, input).await;
        Self::settle(&call.call_id, result)
    }

    /// Ends the call for everybody. Only the initiator may.
    pub async fn end(&self) -> Result<(), CallError> {
        let mut state = self.core.lock().await;
        let Some(call) = state.call.clone() else {
            return Ok(());
        };
        if call.role != ParticipantRole::Initiator {
            return Err(CallError::unauthorized(&call.call_id, self.user_id()));
        }
        let result = self.core.signaling().end_group(&call_ref(&call)?).await;
        self.core
            .apply_locked(
                &mut state,
                Input::HungUp {
                    call_id: call.call_id.clone(),
                },
            )
            .await;
        Self::settle(&call.call_id, result)
    }

    /// Withdraws our own invite before anybody accepted.
    pub async fn cancel(&self) -> Result<(), CallError> {
        let mut state = self.core.lock().await;
        let Some(call) = state.call.clone() else {
            return Ok(());
        };
        if call.phase != Phase::Dialing {
            return Err(CallError::conflict(format!("{:?}", call.phase), "cancel"));
        }
        let result = self.core.signaling().cancel_group(&call_ref(&call)?).await;
        self.core
            .apply_locked(
                &mut state,
                Input::HungUp {
                    call_id: call.call_id.clone(),
                },
            )
            .await;
        Self::settle(&call.call_id, result)
    }

    /// Re-enters a running call we left earlier.
    pub async fn rejoin(&self, call: GroupCallRef, call_type: CallType) -> Result<(), CallError> {
        let mut state = self.core.lock().await;
        if !state.is_idle() {
            return Err(CallError::Busy(self.user_id().clone()));
        }
        let receipt = self.core.signaling().join_group(&call).await?;
        self.core
            .apply_locked(
                &mut state,
                Input::Rejoined(Dialed {
                    call_id: receipt.call_id,
                    channel: receipt.channel,
                    call_type,
                    group_id: Some(receipt.group),
                    peer: None,
                    participants: receipt.participants,
                }),
            )
            .await;
        Ok(())
    }

    /// Rings `target` again in the current call.
    pub async fn recall(&self, target: UserId) -> Result<(), CallError> {
        let state = self.core.lock().await;
        let call = state
            .call
            .as_ref()
            .ok_or_else(|| CallError::NotFound("no active group call".into()))?;
        let call = call_ref(call)?;
        drop(state);
        self.core
            .signaling()
            .recall_participant(RecallParticipant { call, target })
            .await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.core.media().set_muted(muted).await
    }

    fn settle(call_id: &CallId, result: Result<(), CallError>) -> Result<(), CallError> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => {
                warn!("leaving group call {} not confirmed by the registry: {}", call_id, e);
                Err(e)
            }
        }
    }
}
