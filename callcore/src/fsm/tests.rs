use super::*;
use crate::types::GroupId;

fn alice() -> UserId {
    UserId::new("alice")
}

fn summary(id: &str, status: ParticipantStatus) -> ParticipantSummary {
    ParticipantSummary {
        id: UserId::new(id),
        name: id.to_uppercase(),
        status,
    }
}

fn apply(state: &ControllerState, input: Input) -> (ControllerState, Vec<Effect>) {
    match step(state, &input) {
        Step::Applied { next, effects } => (next, effects),
        Step::Ignored(why) => panic!("input {input:?} ignored: {why}"),
    }
}

fn joins(effects: &[Effect]) -> usize {
    effects
        .iter()
        .filter(|e| matches!(e, Effect::JoinMedia { .. }))
        .count()
}

fn dialing_personal() -> (ControllerState, CallId) {
    let call_id = CallId::new("call-1");
    let state = ControllerState::idle(alice(), CallKind::Personal);
    let (state, effects) = apply(
        &state,
        Input::Dialed(Dialed {
            call_id: call_id.clone(),
            channel: ChannelId::new("p-chan"),
            call_type: CallType::Voice,
            group_id: None,
            peer: Some(summary("bob", ParticipantStatus::Calling)),
            participants: vec![
                summary("alice", ParticipantStatus::Accepted),
                summary("bob", ParticipantStatus::Calling),
            ],
        }),
    );
    assert!(matches!(effects[0], Effect::StartCountdown { .. }));
    (state, call_id)
}

#[test]
fn duplicate_call_accepted_joins_once() {
    let (state, call_id) = dialing_personal();
    let accepted = Input::Signal(SignalEvent::CallAccepted {
        call_id: call_id.clone(),
        by: UserId::new("bob"),
    });

    let (state, effects) = apply(&state, accepted.clone());
    assert_eq!(joins(&effects), 1);
    assert!(effects.contains(&Effect::CancelCountdown));
    assert_eq!(state.phase(), Some(Phase::Accepted));

    assert!(step(&state, &accepted).is_ignored());
    let started = Input::Signal(SignalEvent::CallStarted {
        call_id,
        channel: ChannelId::new("p-chan"),
    });
    assert!(step(&state, &started).is_ignored());
}

#[test]
fn call_started_before_accepted_still_joins_once() {
    let (state, call_id) = dialing_personal();
    let (state, effects) = apply(
        &state,
        Input::Signal(SignalEvent::CallStarted {
            call_id: call_id.clone(),
            channel: ChannelId::new("p-chan"),
        }),
    );
    assert_eq!(joins(&effects), 1);
    let late = Input::Signal(SignalEvent::CallAccepted {
        call_id,
        by: UserId::new("bob"),
    });
    assert!(step(&state, &late).is_ignored());
}

#[test]
fn accepted_after_ended_is_dropped() {
    let (state, call_id) = dialing_personal();
    let (state, effects) = apply(
        &state,
        Input::Signal(SignalEvent::CallEnded {
            call_id: call_id.clone(),
            ended_by: Some(UserId::new("bob")),
            reason: Some(EndReason::Hangup),
            duration_seconds: None,
        }),
    );
    assert!(state.is_idle());
    assert!(effects.contains(&Effect::LeaveMedia));
    assert_eq!(joins(&effects), 0);

    let late = Input::Signal(SignalEvent::CallAccepted {
        call_id,
        by: UserId::new("bob"),
    });
    assert!(step(&state, &late).is_ignored());
}

#[test]
fn terminal_event_always_leaves_media() {
    // Even when no join was ever requested.
    let (state, call_id) = dialing_personal();
    let (_, effects) = apply(&state, Input::HungUp { call_id });
    assert!(effects.contains(&Effect::LeaveMedia));
    assert!(effects.contains(&Effect::CancelCountdown));
}

#[test]
fn countdown_expiry_reports_missed() {
    let (state, call_id) = dialing_personal();
    let (state, effects) = apply(
        &state,
        Input::CountdownExpired {
            call_id: call_id.clone(),
        },
    );
    assert!(state.is_idle());
    assert_eq!(
        effects[0],
        Effect::ReportMissed {
            call_id: call_id.clone(),
            group_id: None
        }
    );
    assert!(effects.iter().any(|e| matches!(
        e,
        Effect::Publish(CallUpdate::Finished {
            status: SessionStatus::Missed,
            ..
        })
    )));

    // A second expiry (or one racing the missed broadcast) is stale.
    assert!(step(&state, &Input::CountdownExpired { call_id }).is_ignored());
}

#[test]
fn countdown_after_accept_is_stale() {
    let (state, call_id) = dialing_personal();
    let (state, _) = apply(
        &state,
        Input::Signal(SignalEvent::CallAccepted {
            call_id: call_id.clone(),
            by: UserId::new("bob"),
        }),
    );
    assert!(step(&state, &Input::CountdownExpired { call_id }).is_ignored());
}

#[test]
fn incoming_call_rings_once() {
    let state = ControllerState::idle(UserId::new("bob"), CallKind::Personal);
    let incoming = Input::Signal(SignalEvent::IncomingCall {
        call_id: CallId::new("call-9"),
        caller: summary("alice", ParticipantStatus::Accepted),
        call_type: CallType::Voice,
        channel: ChannelId::new("p-x"),
    });
    let (state, effects) = apply(&state, incoming.clone());
    assert_eq!(state.phase(), Some(Phase::Ringing));
    assert!(effects.iter().any(|e| matches!(e, Effect::NotifyIncoming { .. })));
    assert!(effects.iter().any(|e| matches!(e, Effect::AcknowledgeRing { .. })));
    assert!(step(&state, &incoming).is_ignored());
}

#[test]
fn incoming_while_busy_is_ignored() {
    let (state, _) = dialing_personal();
    let incoming = Input::Signal(SignalEvent::IncomingCall {
        call_id: CallId::new("other"),
        caller: summary("carol", ParticipantStatus::Accepted),
        call_type: CallType::Voice,
        channel: ChannelId::new("p-y"),
    });
    assert!(step(&state, &incoming).is_ignored());
}

#[test]
fn decline_finishes_as_rejected() {
    let state = ControllerState::idle(UserId::new("bob"), CallKind::Personal);
    let call_id = CallId::new("call-9");
    let (state, _) = apply(
        &state,
        Input::Signal(SignalEvent::IncomingCall {
            call_id: call_id.clone(),
            caller: summary("alice", ParticipantStatus::Accepted),
            call_type: CallType::Voice,
            channel: ChannelId::new("p-x"),
        }),
    );
    let (state, effects) = apply(
        &state,
        Input::Answered {
            call_id: call_id.clone(),
            accepted: false,
        },
    );
    assert!(state.is_idle());
    assert!(effects.contains(&Effect::DismissNotification { call_id }));
    assert_eq!(joins(&effects), 0);
}

#[test]
fn media_failure_keeps_signaling_state() {
    let (state, call_id) = dialing_personal();
    let (state, _) = apply(
        &state,
        Input::Signal(SignalEvent::CallAccepted {
            call_id: call_id.clone(),
            by: UserId::new("bob"),
        }),
    );
    let (state, effects) = apply(
        &state,
        Input::MediaFailed {
            call_id: call_id.clone(),
        },
    );
    assert_eq!(state.phase(), Some(Phase::Accepted));
    assert_eq!(
        effects,
        vec![Effect::Publish(CallUpdate::MediaUnavailable { call_id })]
    );
}

#[test]
fn media_connected_reports_once() {
    let (state, call_id) = dialing_personal();
    let (state, _) = apply(
        &state,
        Input::Signal(SignalEvent::CallAccepted {
            call_id: call_id.clone(),
            by: UserId::new("bob"),
        }),
    );
    let connected = Input::MediaConnected {
        call_id: call_id.clone(),
    };
    let (state, effects) = apply(&state, connected.clone());
    assert!(effects.iter().any(|e| matches!(e, Effect::ReportConnected { .. })));
    assert!(step(&state, &connected).is_ignored());
}

#[test]
fn kinds_do_not_cross() {
    let state = ControllerState::idle(UserId::new("bob"), CallKind::Personal);
    let group_ring = Input::Signal(SignalEvent::GroupIncomingCall {
        call_id: CallId::new("g-call"),
        group_id: GroupId::new("g1"),
        initiator: summary("alice", ParticipantStatus::Accepted),
        call_type: CallType::Voice,
        channel: ChannelId::new("g-x"),
        participants: vec![],
    });
    assert!(step(&state, &group_ring).is_ignored());
}

fn group_dialing() -> (ControllerState, CallId) {
    let call_id = CallId::new("g-call");
    let state = ControllerState::idle(alice(), CallKind::Group);
    let (state, effects) = apply(
        &state,
        Input::Dialed(Dialed {
            call_id: call_id.clone(),
            channel: ChannelId::new("g-chan"),
            call_type: CallType::Voice,
            group_id: Some(GroupId::new("g1")),
            peer: None,
            participants: vec![
                summary("alice", ParticipantStatus::Accepted),
                summary("bob", ParticipantStatus::Calling),
                summary("carol", ParticipantStatus::Calling),
            ],
        }),
    );
    assert!(effects.contains(&Effect::WatchGroup {
        group_id: GroupId::new("g1")
    }));
    (state, call_id)
}

#[test]
fn group_first_acceptance_confirms_initiator() {
    let (state, call_id) = group_dialing();
    let answered = |user: &str, accepted: bool| {
        Input::Signal(SignalEvent::GroupCallAnswered {
            call_id: call_id.clone(),
            group_id: GroupId::new("g1"),
            user_id: UserId::new(user),
            accepted,
        })
    };

    // A decline only updates the roster.
    let (state, effects) = apply(&state, answered("carol", false));
    assert_eq!(joins(&effects), 0);
    assert_eq!(state.phase(), Some(Phase::Dialing));

    let (state, effects) = apply(&state, answered("bob", true));
    assert_eq!(joins(&effects), 1);
    assert_eq!(state.phase(), Some(Phase::Accepted));
    let roster = &state.call.as_ref().unwrap().participants;
    assert_eq!(roster[1].status, ParticipantStatus::Accepted);
    assert_eq!(roster[2].status, ParticipantStatus::Rejected);

    assert!(step(&state, &answered("bob", true)).is_ignored());
}

#[test]
fn group_hangup_while_dialing_is_cancel() {
    let (state, call_id) = group_dialing();
    let (_, effects) = apply(&state, Input::HungUp { call_id });
    assert!(effects.iter().any(|e| matches!(
        e,
        Effect::Publish(CallUpdate::Finished {
            status: SessionStatus::Cancelled,
            ..
        })
    )));
}

#[test]
fn group_member_removed_elsewhere_goes_idle() {
    let state = ControllerState::idle(UserId::new("bob"), CallKind::Group);
    let call_id = CallId::new("g-call");
    let (state, _) = apply(
        &state,
        Input::Signal(SignalEvent::GroupIncomingCall {
            call_id: call_id.clone(),
            group_id: GroupId::new("g1"),
            initiator: summary("alice", ParticipantStatus::Accepted),
            call_type: CallType::Voice,
            channel: ChannelId::new("g-chan"),
            participants: vec![summary("alice", ParticipantStatus::Accepted)],
        }),
    );
    let (state, effects) = apply(
        &state,
        Input::Signal(SignalEvent::GroupParticipantLeft {
            call_id,
            group_id: GroupId::new("g1"),
            user_id: UserId::new("bob"),
        }),
    );
    assert!(state.is_idle());
    assert!(effects.contains(&Effect::LeaveMedia));
}

#[test]
fn rejoin_goes_straight_to_media() {
    let state = ControllerState::idle(UserId::new("carol"), CallKind::Group);
    let rejoined = Input::Rejoined(Dialed {
        call_id: CallId::new("g-call"),
        channel: ChannelId::new("g-chan"),
        call_type: CallType::Voice,
        group_id: Some(GroupId::new("g1")),
        peer: None,
        participants: vec![summary("carol", ParticipantStatus::Accepted)],
    });
    let (next, effects) = apply(&state, rejoined.clone());
    assert_eq!(next.phase(), Some(Phase::Accepted));
    assert_eq!(joins(&effects), 1);
    assert!(!effects.iter().any(|e| matches!(e, Effect::StartCountdown { .. })));

    assert!(step(&next, &rejoined).is_ignored());
    let personal = ControllerState::idle(UserId::new("carol"), CallKind::Personal);
    assert!(step(&personal, &rejoined).is_ignored());
}
