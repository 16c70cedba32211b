//! Client-side call state machine.
//!
//! [`step`] is a pure function from the current [`ControllerState`] and one
//! [`Input`] to the next state plus the [`Effect`]s the controller has to run.
//! It never performs I/O, which keeps duplicate/out-of-order event handling
//! testable without timers or a transport.
//!
//! Flow (caller):  Idle → Dialing → Accepted → Connected → Idle
//! Flow (callee):  Idle → Ringing → Accepted → Connected → Idle

mod group;
mod personal;

use serde::Serialize;

use crate::events::SignalEvent;
use crate::types::{
    CallId, CallKind, CallType, ChannelId, EndReason, GroupId, ParticipantRole,
    ParticipantStatus, ParticipantSummary, SessionStatus, UserId,
};

/// Local phase of the one call a controller tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    /// Outgoing: invite sent, nobody has accepted yet.
    Dialing,
    /// Incoming: we are being rung.
    Ringing,
    /// Accept confirmed, media join requested.
    Accepted,
    /// Media joined.
    Connected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveCall {
    pub call_id: CallId,
    pub kind: CallKind,
    pub call_type: CallType,
    pub channel: ChannelId,
    pub role: ParticipantRole,
    pub group_id: Option<GroupId>,
    /// The other side of a personal call, or the initiator of a group call.
    pub peer: Option<ParticipantSummary>,
    pub participants: Vec<ParticipantSummary>,
    pub phase: Phase,
    pub remote_ringing: bool,
}

impl ActiveCall {
    fn roster_entry_mut(&mut self, user: &UserId) -> Option<&mut ParticipantSummary> {
        self.participants.iter_mut().find(|p| &p.id == user)
    }

    /// Returns false when the roster already says so (duplicate delivery).
    fn set_roster_status(&mut self, user: &UserId, status: ParticipantStatus) -> bool {
        match self.roster_entry_mut(user) {
            Some(entry) if entry.status == status => false,
            Some(entry) => {
                entry.status = status;
                true
            }
            None => {
                self.participants.push(ParticipantSummary {
                    id: user.clone(),
                    name: user.to_string(),
                    status,
                });
                true
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerState {
    pub user: UserId,
    pub kind: CallKind,
    pub call: Option<ActiveCall>,
}

impl ControllerState {
    pub fn idle(user: UserId, kind: CallKind) -> Self {
        Self {
            user,
            kind,
            call: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.call.is_none()
    }

    pub fn call_id(&self) -> Option<&CallId> {
        self.call.as_ref().map(|c| &c.call_id)
    }

    pub fn phase(&self) -> Option<Phase> {
        self.call.as_ref().map(|c| c.phase)
    }

    fn with_call(&self, call: Option<ActiveCall>) -> Self {
        Self {
            user: self.user.clone(),
            kind: self.kind,
            call,
        }
    }
}

/// Our own invite as acknowledged by the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct Dialed {
    pub call_id: CallId,
    pub channel: ChannelId,
    pub call_type: CallType,
    pub group_id: Option<GroupId>,
    pub peer: Option<ParticipantSummary>,
    pub participants: Vec<ParticipantSummary>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Dialed(Dialed),
    /// We re-entered a live group call we had left earlier.
    Rejoined(Dialed),
    /// The local user answered and the registry acknowledged it.
    Answered { call_id: CallId, accepted: bool },
    /// The local user hung up, cancelled or left and the registry was told.
    HungUp { call_id: CallId },
    CountdownExpired { call_id: CallId },
    MediaConnected { call_id: CallId },
    MediaFailed { call_id: CallId },
    Signal(SignalEvent),
}

/// Things the controller's effect runner has to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartCountdown { call_id: CallId },
    CancelCountdown,
    AcknowledgeRing { call_id: CallId, group_id: Option<GroupId> },
    NotifyIncoming { call_id: CallId },
    DismissNotification { call_id: CallId },
    JoinMedia { call_id: CallId, channel: ChannelId },
    LeaveMedia,
    ReportMissed { call_id: CallId, group_id: Option<GroupId> },
    ReportConnected { call_id: CallId, group_id: Option<GroupId> },
    WatchGroup { group_id: GroupId },
    Publish(CallUpdate),
}

/// What observers are told about.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CallUpdate {
    Incoming(ActiveCall),
    PhaseChanged {
        call_id: CallId,
        phase: Phase,
    },
    RemoteRinging {
        call_id: CallId,
    },
    Roster {
        call_id: CallId,
        participants: Vec<ParticipantSummary>,
    },
    MediaUnavailable {
        call_id: CallId,
    },
    Finished {
        call_id: CallId,
        status: SessionStatus,
        reason: Option<EndReason>,
        duration_seconds: Option<i64>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Applied {
        next: ControllerState,
        effects: Vec<Effect>,
    },
    /// Stale, duplicate or unrelated input; state is unchanged.
    Ignored(&'static str),
}

impl Step {
    pub fn is_ignored(&self) -> bool {
        matches!(self, Step::Ignored(_))
    }

    pub fn effects(&self) -> &[Effect] {
        match self {
            Step::Applied { effects, .. } => effects,
            Step::Ignored(_) => &[],
        }
    }
}

/// Apply one input to the state.
pub fn step(state: &ControllerState, input: &Input) -> Step {
    if let Input::Signal(event) = input
        && event.is_group() != (state.kind == CallKind::Group)
    {
        return Step::Ignored("event for the other call kind");
    }
    match state.kind {
        CallKind::Personal => personal::step(state, input),
        CallKind::Group => group::step(state, input),
    }
}

// Shared transitions used by both kinds.

fn is_current(state: &ControllerState, call_id: &CallId) -> bool {
    state.call_id() == Some(call_id)
}

fn dial(state: &ControllerState, dialed: &Dialed) -> Step {
    if !state.is_idle() {
        return Step::Ignored("already in a call");
    }
    let call = ActiveCall {
        call_id: dialed.call_id.clone(),
        kind: state.kind,
        call_type: dialed.call_type,
        channel: dialed.channel.clone(),
        role: ParticipantRole::Initiator,
        group_id: dialed.group_id.clone(),
        peer: dialed.peer.clone(),
        participants: dialed.participants.clone(),
        phase: Phase::Dialing,
        remote_ringing: false,
    };
    let mut effects = vec![Effect::StartCountdown {
        call_id: call.call_id.clone(),
    }];
    if let Some(group_id) = &call.group_id {
        effects.push(Effect::WatchGroup {
            group_id: group_id.clone(),
        });
    }
    effects.push(Effect::Publish(CallUpdate::PhaseChanged {
        call_id: call.call_id.clone(),
        phase: Phase::Dialing,
    }));
    Step::Applied {
        next: state.with_call(Some(call)),
        effects,
    }
}

fn ring(state: &ControllerState, call: ActiveCall) -> Step {
    let call_id = call.call_id.clone();
    let mut effects = vec![
        Effect::StartCountdown {
            call_id: call_id.clone(),
        },
        Effect::AcknowledgeRing {
            call_id: call_id.clone(),
            group_id: call.group_id.clone(),
        },
        Effect::NotifyIncoming {
            call_id: call_id.clone(),
        },
    ];
    if let Some(group_id) = &call.group_id {
        effects.push(Effect::WatchGroup {
            group_id: group_id.clone(),
        });
    }
    effects.push(Effect::Publish(CallUpdate::Incoming(call.clone())));
    Step::Applied {
        next: state.with_call(Some(call)),
        effects,
    }
}

/// Enter `Accepted` and request the media join. Only valid from the unanswered phases.
fn accept_confirmed(state: &ControllerState, call_id: &CallId) -> Step {
    let Some(call) = state.call.as_ref().filter(|c| &c.call_id == call_id) else {
        return Step::Ignored("unrelated call");
    };
    if !matches!(call.phase, Phase::Dialing | Phase::Ringing) {
        return Step::Ignored("already accepted");
    }
    let mut next = call.clone();
    next.phase = Phase::Accepted;
    let mut effects = vec![Effect::CancelCountdown];
    if call.phase == Phase::Ringing {
        effects.push(Effect::DismissNotification {
            call_id: call_id.clone(),
        });
    }
    effects.push(Effect::JoinMedia {
        call_id: call_id.clone(),
        channel: call.channel.clone(),
    });
    effects.push(Effect::Publish(CallUpdate::PhaseChanged {
        call_id: call_id.clone(),
        phase: Phase::Accepted,
    }));
    Step::Applied {
        next: state.with_call(Some(next)),
        effects,
    }
}

/// Reset to idle. Media leave and timer cancellation are unconditional.
fn finish(
    state: &ControllerState,
    call_id: &CallId,
    status: SessionStatus,
    reason: Option<EndReason>,
    duration_seconds: Option<i64>,
) -> Step {
    if !is_current(state, call_id) {
        return Step::Ignored("unrelated call");
    }
    Step::Applied {
        next: state.with_call(None),
        effects: vec![
            Effect::CancelCountdown,
            Effect::DismissNotification {
                call_id: call_id.clone(),
            },
            Effect::LeaveMedia,
            Effect::Publish(CallUpdate::Finished {
                call_id: call_id.clone(),
                status,
                reason,
                duration_seconds,
            }),
        ],
    }
}

fn expire(state: &ControllerState, call_id: &CallId) -> Step {
    let Some(call) = state.call.as_ref().filter(|c| &c.call_id == call_id) else {
        return Step::Ignored("stale countdown");
    };
    if !matches!(call.phase, Phase::Dialing | Phase::Ringing) {
        return Step::Ignored("countdown fired after accept");
    }
    let group_id = call.group_id.clone();
    match finish(state, call_id, SessionStatus::Missed, Some(EndReason::Timeout), None) {
        Step::Applied { next, mut effects } => {
            effects.insert(
                0,
                Effect::ReportMissed {
                    call_id: call_id.clone(),
                    group_id,
                },
            );
            Step::Applied { next, effects }
        }
        ignored => ignored,
    }
}

fn media_connected(state: &ControllerState, call_id: &CallId) -> Step {
    let Some(call) = state.call.as_ref().filter(|c| &c.call_id == call_id) else {
        return Step::Ignored("media joined for a call that is gone");
    };
    if call.phase != Phase::Accepted {
        return Step::Ignored("media already connected");
    }
    let mut next = call.clone();
    next.phase = Phase::Connected;
    Step::Applied {
        next: state.with_call(Some(next)),
        effects: vec![
            Effect::ReportConnected {
                call_id: call_id.clone(),
                group_id: call.group_id.clone(),
            },
            Effect::Publish(CallUpdate::PhaseChanged {
                call_id: call_id.clone(),
                phase: Phase::Connected,
            }),
        ],
    }
}

fn media_failed(state: &ControllerState, call_id: &CallId) -> Step {
    if !is_current(state, call_id) {
        return Step::Ignored("media failure for a call that is gone");
    }
    // Signaling state is kept; the user decides whether to hang up.
    Step::Applied {
        next: state.clone(),
        effects: vec![Effect::Publish(CallUpdate::MediaUnavailable {
            call_id: call_id.clone(),
        })],
    }
}

fn local_answer(state: &ControllerState, call_id: &CallId, accepted: bool) -> Step {
    let Some(call) = state.call.as_ref().filter(|c| &c.call_id == call_id) else {
        return Step::Ignored("unrelated call");
    };
    if accepted {
        return accept_confirmed(state, call_id);
    }
    if call.phase != Phase::Ringing {
        return Step::Ignored("nothing to decline");
    }
    // For a group ring this only ends the call for us.
    finish(
        state,
        call_id,
        SessionStatus::Rejected,
        Some(EndReason::Declined),
        None,
    )
}

fn local_hangup(state: &ControllerState, call_id: &CallId) -> Step {
    let Some(call) = state.call.as_ref().filter(|c| &c.call_id == call_id) else {
        return Step::Ignored("unrelated call");
    };
    let (status, reason) = match (state.kind, call.phase) {
        (CallKind::Group, Phase::Dialing) => (SessionStatus::Cancelled, EndReason::Cancelled),
        (CallKind::Group, _) => (SessionStatus::Ended, EndReason::Left),
        (CallKind::Personal, _) => (SessionStatus::Ended, EndReason::Hangup),
    };
    finish(state, call_id, status, Some(reason), None)
}

#[cfg(test)]
mod tests;
