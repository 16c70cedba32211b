use super::{
    ActiveCall, CallUpdate, ControllerState, Effect, Input, Phase, Step, accept_confirmed, dial,
    expire, finish, is_current, local_answer, local_hangup, media_connected, media_failed, ring,
};
use crate::events::SignalEvent;
use crate::types::{
    CallKind, EndReason, ParticipantRole, ParticipantStatus, ParticipantSummary, SessionStatus,
};

pub(super) fn step(state: &ControllerState, input: &Input) -> Step {
    match input {
        Input::Dialed(dialed) => dial(state, dialed),
        Input::Rejoined(_) => Step::Ignored("personal calls cannot be rejoined"),
        Input::Answered { call_id, accepted } => local_answer(state, call_id, *accepted),
        Input::HungUp { call_id } => local_hangup(state, call_id),
        Input::CountdownExpired { call_id } => expire(state, call_id),
        Input::MediaConnected { call_id } => media_connected(state, call_id),
        Input::MediaFailed { call_id } => media_failed(state, call_id),
        Input::Signal(event) => on_signal(state, event),
    }
}

fn on_signal(state: &ControllerState, event: &SignalEvent) -> Step {
    match event {
        SignalEvent::IncomingCall {
            call_id,
            caller,
            call_type,
            channel,
        } => {
            if is_current(state, call_id) {
                return Step::Ignored("duplicate incoming call");
            }
            if !state.is_idle() {
                return Step::Ignored("busy with another call");
            }
            let me = ParticipantSummary {
                id: state.user.clone(),
                name: state.user.to_string(),
                status: ParticipantStatus::Ringing,
            };
            ring(
                state,
                ActiveCall {
                    call_id: call_id.clone(),
                    kind: CallKind::Personal,
                    call_type: *call_type,
                    channel: channel.clone(),
                    role: ParticipantRole::Invitee,
                    group_id: None,
                    peer: Some(caller.clone()),
                    participants: vec![caller.clone(), me],
                    phase: Phase::Ringing,
                    remote_ringing: false,
                },
            )
        }
        SignalEvent::CallRinging { call_id } => {
            let Some(call) = state.call.as_ref().filter(|c| &c.call_id == call_id) else {
                return Step::Ignored("unrelated call");
            };
            if call.phase != Phase::Dialing || call.remote_ringing {
                return Step::Ignored("ringing already known");
            }
            let mut next = call.clone();
            next.remote_ringing = true;
            Step::Applied {
                next: ControllerState {
                    call: Some(next),
                    ..state.clone()
                },
                effects: vec![Effect::Publish(CallUpdate::RemoteRinging {
                    call_id: call_id.clone(),
                })],
            }
        }
        SignalEvent::CallAccepted { call_id, by } => {
            if by == &state.user {
                // Our own answer echoed back; the local Answered input handles it.
                return Step::Ignored("own acceptance");
            }
            accept_confirmed(state, call_id)
        }
        // Also covers a `call-accepted` that was lost or is still in flight.
        SignalEvent::CallStarted { call_id, .. } => accept_confirmed(state, call_id),
        SignalEvent::CallRejected {
            call_id, reason, ..
        } => finish(
            state,
            call_id,
            SessionStatus::Rejected,
            reason.clone().or(Some(EndReason::Declined)),
            None,
        ),
        SignalEvent::CallCancelled { call_id } => finish(
            state,
            call_id,
            SessionStatus::Cancelled,
            Some(EndReason::Cancelled),
            None,
        ),
        SignalEvent::CallMissed { call_id } => finish(
            state,
            call_id,
            SessionStatus::Missed,
            Some(EndReason::Timeout),
            None,
        ),
        SignalEvent::CallEnded {
            call_id,
            reason,
            duration_seconds,
            ..
        } => finish(
            state,
            call_id,
            SessionStatus::Ended,
            reason.clone(),
            *duration_seconds,
        ),
        SignalEvent::GroupIncomingCall { .. }
        | SignalEvent::GroupCallAnswered { .. }
        | SignalEvent::GroupParticipantJoined { .. }
        | SignalEvent::GroupParticipantLeft { .. }
        | SignalEvent::GroupParticipantRecalled { .. }
        | SignalEvent::GroupCallCancelled { .. }
        | SignalEvent::GroupCallMissed { .. }
        | SignalEvent::GroupCallEnded { .. } => Step::Ignored("group event"),
    }
}
