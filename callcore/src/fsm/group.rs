use super::{
    ActiveCall, CallUpdate, ControllerState, Dialed, Effect, Input, Phase, Step, accept_confirmed, dial,
    expire, finish, is_current, local_answer, local_hangup, media_connected, media_failed, ring,
};
use crate::events::SignalEvent;
use crate::types::{
    CallId, CallKind, EndReason, ParticipantRole, ParticipantStatus, SessionStatus, UserId,
};

pub(super) fn step(state: &ControllerState, input: &Input) -> Step {
    match input {
        Input::Dialed(dialed) => dial(state, dialed),
        Input::Rejoined(dialed) => rejoin(state, dialed),
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
        SignalEvent::GroupIncomingCall {
            call_id,
            group_id,
            initiator,
            call_type,
            channel,
            participants,
        } => {
            if is_current(state, call_id) {
                return Step::Ignored("duplicate group ring");
            }
            if !state.is_idle() {
                return Step::Ignored("busy with another call");
            }
            ring(
                state,
                ActiveCall {
                    call_id: call_id.clone(),
                    kind: CallKind::Group,
                    call_type: *call_type,
                    channel: channel.clone(),
                    role: ParticipantRole::Invitee,
                    group_id: Some(group_id.clone()),
                    peer: Some(initiator.clone()),
                    participants: participants.clone(),
                    phase: Phase::Ringing,
                    remote_ringing: false,
                },
            )
        }
        SignalEvent::GroupCallAnswered {
            call_id,
            user_id,
            accepted,
            ..
        } => on_answered(state, call_id, user_id, *accepted),
        SignalEvent::GroupParticipantJoined {
            call_id, user_id, ..
        } => roster_update(state, call_id, user_id, ParticipantStatus::Accepted),
        SignalEvent::GroupParticipantLeft {
            call_id, user_id, ..
        } => {
            if user_id == &state.user && is_current(state, call_id) {
                // We left from somewhere else (another device or a server-side removal).
                return finish(
                    state,
                    call_id,
                    SessionStatus::Ended,
                    Some(EndReason::Left),
                    None,
                );
            }
            roster_update(state, call_id, user_id, ParticipantStatus::Left)
        }
        SignalEvent::GroupParticipantRecalled {
            call_id, user_id, ..
        } => roster_update(state, call_id, user_id, ParticipantStatus::Recalled),
        SignalEvent::GroupCallCancelled {
            call_id, reason, ..
        } => finish(
            state,
            call_id,
            SessionStatus::Cancelled,
            reason.clone().or(Some(EndReason::Cancelled)),
            None,
        ),
        SignalEvent::GroupCallMissed { call_id, .. } => finish(
            state,
            call_id,
            SessionStatus::Missed,
            Some(EndReason::Timeout),
            None,
        ),
        SignalEvent::GroupCallEnded {
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
        SignalEvent::IncomingCall { .. }
        | SignalEvent::CallRinging { .. }
        | SignalEvent::CallAccepted { .. }
        | SignalEvent::CallStarted { .. }
        | SignalEvent::CallRejected { .. }
        | SignalEvent::CallCancelled { .. }
        | SignalEvent::CallMissed { .. }
        | SignalEvent::CallEnded { .. } => Step::Ignored("personal event"),
    }
}

fn rejoin(state: &ControllerState, dialed: &Dialed) -> Step {
    if !state.is_idle() {
        return Step::Ignored("already in a call");
    }
    let Some(group_id) = dialed.group_id.clone() else {
        return Step::Ignored("rejoin without a group");
    };
    let call_id = dialed.call_id.clone();
    let call = ActiveCall {
        call_id: call_id.clone(),
        kind: CallKind::Group,
        call_type: dialed.call_type,
        channel: dialed.channel.clone(),
        role: ParticipantRole::Invitee,
        group_id: Some(group_id.clone()),
        peer: dialed.peer.clone(),
        participants: dialed.participants.clone(),
        phase: Phase::Accepted,
        remote_ringing: false,
    };
    Step::Applied {
        effects: vec![
            Effect::WatchGroup { group_id },
            Effect::JoinMedia {
                call_id: call_id.clone(),
                channel: call.channel.clone(),
            },
            Effect::Publish(CallUpdate::PhaseChanged {
                call_id,
                phase: Phase::Accepted,
            }),
        ],
        next: ControllerState {
            call: Some(call),
            ..state.clone()
        },
    }
}

fn on_answered(state: &ControllerState, call_id: &CallId, user: &UserId, accepted: bool) -> Step {
    let Some(call) = state.call.as_ref().filter(|c| &c.call_id == call_id) else {
        return Step::Ignored("unrelated call");
    };
    let status = if accepted {
        ParticipantStatus::Accepted
    } else {
        ParticipantStatus::Rejected
    };

    // First acceptance by someone else confirms the call for a dialing initiator.
    if accepted && user != &state.user && call.phase == Phase::Dialing {
        let Step::Applied { next, mut effects } = accept_confirmed(state, call_id) else {
            return Step::Ignored("already accepted");
        };
        let Some(mut next_call) = next.call.clone() else {
            return Step::Ignored("call vanished during accept");
        };
        next_call.set_roster_status(user, status);
        effects.push(Effect::Publish(CallUpdate::Roster {
            call_id: call_id.clone(),
            participants: next_call.participants.clone(),
        }));
        return Step::Applied {
            next: ControllerState {
                call: Some(next_call),
                ..next
            },
            effects,
        };
    }
    roster_update(state, call_id, user, status)
}

fn roster_update(
    state: &ControllerState,
    call_id: &CallId,
    user: &UserId,
    status: ParticipantStatus,
) -> Step {
    let Some(call) = state.call.as_ref().filter(|c| &c.call_id == call_id) else {
        return Step::Ignored("unrelated call");
    };
    let mut next = call.clone();
    if !next.set_roster_status(user, status) {
        return Step::Ignored("roster unchanged");
    }
    let participants = next.participants.clone();
    Step::Applied {
        next: ControllerState {
            call: Some(next),
            ..state.clone()
        },
        effects: vec![Effect::Publish(CallUpdate::Roster {
            call_id: call_id.clone(),
            participants,
        })],
    }
}
