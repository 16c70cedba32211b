use callcore::CallError;
use callcore::api::{AnswerGroup, GroupCallRef, GroupInviteReceipt, InviteGroup, RecallParticipant};
use callcore::events::SignalEvent;
use callcore::notification::IncomingCallNotice;
use callcore::types::{
    CallKind, CallSession, EndReason, GroupId, Participant, ParticipantStatus, ParticipantSummary,
    SessionStatus, UserId,
};
use chrono::Utc;
use log::{debug, info};

use super::{CallRecord, CallRegistry};

const UNANSWERED: [SessionStatus; 2] = [SessionStatus::Calling, SessionStatus::Ringing];

/// Sub-states from which a member can still answer the ring.
const ANSWERABLE: [ParticipantStatus; 3] = [
    ParticipantStatus::Calling,
    ParticipantStatus::Ringing,
    ParticipantStatus::Recalled,
];

const RECALLABLE: [ParticipantStatus; 4] = [
    ParticipantStatus::Calling,
    ParticipantStatus::Ringing,
    ParticipantStatus::Rejected,
    ParticipantStatus::Left,
];

impl CallRegistry {
    /// Rings every other member of `req.group_id`. Members that are busy elsewhere
    /// are still invited; their acceptance is what gets refused.
    pub async fn create_group(
        &self,
        initiator: &UserId,
        req: InviteGroup,
    ) -> Result<GroupInviteReceipt, CallError> {
        let group = self
            .directory
            .group(&req.group_id)
            .ok_or_else(|| CallError::NotFound(format!("group {}", req.group_id)))?;
        let Some(me) = group.members.iter().find(|m| &m.user_id == initiator) else {
            return Err(CallError::Validation(format!(
                "{initiator} is not a member of group {}",
                req.group_id
            )));
        };
        let now = Utc::now();
        let mut participants = vec![Participant::initiator(
            initiator.clone(),
            me.display_name.clone(),
            now,
        )];
        participants.extend(
            group
                .members
                .iter()
                .filter(|m| &m.user_id != initiator)
                .map(|m| Participant::invitee(m.user_id.clone(), m.display_name.clone())),
        );
        if participants.len() < 2 {
            return Err(CallError::Validation(format!(
                "group {} has nobody else to call",
                req.group_id
            )));
        }

        let session = CallSession::new_group(req.group_id.clone(), participants, req.call_type, now);
        let call_id = session.id.clone();
        self.engage(initiator, &call_id)?;

        let record = self.insert(session);
        let mut guard = record.lock().await;
        self.arm_timeout(&mut guard);
        let session = &guard.session;
        let initiator_summary = Self::initiator_summary(session)?;
        let roster = session.roster();
        info!(
            "group call {} created in {} by {} ({} invitee(s))",
            call_id,
            req.group_id,
            initiator,
            roster.len() - 1
        );

        for invitee in session.invitees() {
            self.notify_incoming(
                session,
                &invitee.user_id,
                IncomingCallNotice {
                    caller_name: me.display_name.clone(),
                    group_name: Some(group.name.clone()),
                },
            )
            .await;
            self.to_user(
                &invitee.user_id,
                SignalEvent::GroupIncomingCall {
                    call_id: call_id.clone(),
                    group_id: req.group_id.clone(),
                    initiator: initiator_summary.clone(),
                    call_type: session.call_type,
                    channel: session.channel.clone(),
                    participants: roster.clone(),
                },
            );
        }

        Ok(GroupInviteReceipt {
            call_id,
            channel: session.channel.clone(),
            group: req.group_id,
            participants: roster,
        })
    }

    /// A member's client confirms the ring reached it. Only the member's sub-state changes.
    pub async fn ring_group(&self, user: &UserId, call: &GroupCallRef) -> Result<(), CallError> {
        let record = self.record(&call.call_id)?;
        let mut guard = self
            .lock_for(&record, CallKind::Group, user)
            .await?;
        Self::check_group(&guard.session, &call.group_id)?;
        guard.session.set_participant_status(
            user,
            &[ParticipantStatus::Calling, ParticipantStatus::Recalled],
            ParticipantStatus::Ringing,
            Utc::now(),
        )?;
        debug!("group call {} ringing for {}", call.call_id, user);
        Ok(())
    }

    /// The first acceptance moves the session to `accepted` and disarms the ring window
    /// for good; declines only touch the member, unless every invitee has declined.
    pub async fn answer_group(&self, user: &UserId, req: AnswerGroup) -> Result<(), CallError> {
        let call = &req.call;
        let record = self.record(&call.call_id)?;
        let mut guard = self
            .lock_for(&record, CallKind::Group, user)
            .await?;
        Self::check_group(&guard.session, &call.group_id)?;
        if guard.session.is_initiator(user) {
            return Err(CallError::unauthorized(&call.call_id, user));
        }
        let now = Utc::now();

        if req.accepted {
            let previous = guard.session.set_participant_status(
                user,
                &ANSWERABLE,
                ParticipantStatus::Accepted,
                now,
            )?;
            if let Err(e) = self.engage(user, &call.call_id) {
                if let Some(member) = guard.session.participant_mut(user) {
                    member.status = previous;
                    member.joined_at = None;
                }
                return Err(e);
            }
            if guard.session.status.is_unanswered() {
                guard
                    .session
                    .compare_and_set(&UNANSWERED, SessionStatus::Accepted)?;
                guard.disarm_timeout();
                info!("group call {} accepted (first: {})", call.call_id, user);
            } else {
                info!("{} joined group call {}", user, call.call_id);
            }
            self.close_notification(&guard.session, user).await;
            self.to_group(
                &call.group_id,
                SignalEvent::GroupCallAnswered {
                    call_id: call.call_id.clone(),
                    group_id: call.group_id.clone(),
                    user_id: user.clone(),
                    accepted: true,
                },
            );
            return Ok(());
        }

        guard.session.set_participant_status(
            user,
            &ANSWERABLE,
            ParticipantStatus::Rejected,
            now,
        )?;
        info!("{} declined group call {}", user, call.call_id);
        self.close_notification(&guard.session, user).await;
        self.to_group(
            &call.group_id,
            SignalEvent::GroupCallAnswered {
                call_id: call.call_id.clone(),
                group_id: call.group_id.clone(),
                user_id: user.clone(),
                accepted: false,
            },
        );

        let everyone_declined = guard
            .session
            .invitees()
            .all(|p| p.status == ParticipantStatus::Rejected);
        if guard.session.status.is_unanswered() && everyone_declined {
            self.cancel_locked(&mut guard, EndReason::Declined).await?;
            info!("group call {} cancelled: every invitee declined", call.call_id);
        }
        Ok(())
    }

    /// The initiator ends the call for everyone.
    pub async fn end_group(&self, user: &UserId, call: &GroupCallRef) -> Result<(), CallError> {
        let record = self.record(&call.call_id)?;
        let mut guard = self
            .lock_for(&record, CallKind::Group, user)
            .await?;
        Self::check_group(&guard.session, &call.group_id)?;
        if !guard.session.is_initiator(user) {
            return Err(CallError::unauthorized(&call.call_id, user));
        }
        self.end_locked(&mut guard, user, EndReason::Hangup).await?;
        info!("group call {} ended by {}", call.call_id, user);
        Ok(())
    }

    /// The initiator withdraws the ring before anybody accepted.
    pub async fn cancel_group(&self, user: &UserId, call: &GroupCallRef) -> Result<(), CallError> {
        let record = self.record(&call.call_id)?;
        let mut guard = self
            .lock_for(&record, CallKind::Group, user)
            .await?;
        Self::check_group(&guard.session, &call.group_id)?;
        if !guard.session.is_initiator(user) {
            return Err(CallError::unauthorized(&call.call_id, user));
        }
        self.cancel_locked(&mut guard, EndReason::Cancelled).await?;
        info!("group call {} cancelled by {}", call.call_id, user);
        Ok(())
    }

    /// An accepted member drops out. The call ends once fewer than two accepted
    /// members remain; the initiator leaving an unanswered call cancels it.
    pub async fn leave_group(&self, user: &UserId, call: &GroupCallRef) -> Result<(), CallError> {
        let record = self.record(&call.call_id)?;
        let mut guard = self
            .lock_for(&record, CallKind::Group, user)
            .await?;
        Self::check_group(&guard.session, &call.group_id)?;
        if guard.session.is_initiator(user) && guard.session.status.is_unanswered() {
            self.cancel_locked(&mut guard, EndReason::Cancelled).await?;
            info!("group call {} cancelled: initiator left", call.call_id);
            return Ok(());
        }

        guard.session.set_participant_status(
            user,
            &[ParticipantStatus::Accepted],
            ParticipantStatus::Left,
            Utc::now(),
        )?;
        self.release(user, &call.call_id);
        info!("{} left group call {}", user, call.call_id);
        self.to_group(
            &call.group_id,
            SignalEvent::GroupParticipantLeft {
                call_id: call.call_id.clone(),
                group_id: call.group_id.clone(),
                user_id: user.clone(),
            },
        );

        if guard.session.status.is_live() && guard.session.accepted_count() < 2 {
            self.end_locked(&mut guard, user, EndReason::Left).await?;
            info!("group call {} ended: not enough participants left", call.call_id);
        }
        Ok(())
    }

    /// Re-enters a live call after leaving it or after a recall. Returns what the
    /// client needs to rejoin media.
    pub async fn join_group(
        &self,
        user: &UserId,
        call: &GroupCallRef,
    ) -> Result<GroupInviteReceipt, CallError> {
        let record = self.record(&call.call_id)?;
        let mut guard = self
            .lock_for(&record, CallKind::Group, user)
            .await?;
        Self::check_group(&guard.session, &call.group_id)?;
        let status = guard.session.status;
        if !status.is_live() {
            return Err(CallError::conflict(status.to_string(), "join"));
        }
        let previous = guard.session.set_participant_status(
            user,
            &[ParticipantStatus::Left, ParticipantStatus::Recalled],
            ParticipantStatus::Accepted,
            Utc::now(),
        )?;
        if let Err(e) = self.engage(user, &call.call_id) {
            if let Some(member) = guard.session.participant_mut(user) {
                member.status = previous;
            }
            return Err(e);
        }
        self.close_notification(&guard.session, user).await;
        info!("{} rejoined group call {}", user, call.call_id);
        self.to_group(
            &call.group_id,
            SignalEvent::GroupParticipantJoined {
                call_id: call.call_id.clone(),
                group_id: call.group_id.clone(),
                user_id: user.clone(),
            },
        );
        Ok(GroupInviteReceipt {
            call_id: call.call_id.clone(),
            channel: guard.session.channel.clone(),
            group: call.group_id.clone(),
            participants: guard.session.roster(),
        })
    }

    /// Rings one member again. Only members currently in the call may recall.
    pub async fn recall_participant(
        &self,
        user: &UserId,
        req: RecallParticipant,
    ) -> Result<(), CallError> {
        let call = &req.call;
        let record = self.record(&call.call_id)?;
        let mut guard = self
            .lock_for(&record, CallKind::Group, user)
            .await?;
        Self::check_group(&guard.session, &call.group_id)?;
        if guard
            .session
            .participant(user)
            .is_none_or(|p| p.status != ParticipantStatus::Accepted)
        {
            return Err(CallError::unauthorized(&call.call_id, user));
        }
        if &req.target == user {
            return Err(CallError::Validation("cannot recall yourself".into()));
        }
        if !guard.session.is_participant(&req.target) {
            return Err(CallError::NotFound(format!(
                "{} in call {}",
                req.target, call.call_id
            )));
        }
        guard.session.set_participant_status(
            &req.target,
            &RECALLABLE,
            ParticipantStatus::Recalled,
            Utc::now(),
        )?;

        let session = &guard.session;
        let initiator = Self::initiator_summary(session)?;
        let group_name = self.directory.group(&call.group_id).map(|g| g.name);
        info!("{} recalled {} into group call {}", user, req.target, call.call_id);
        self.notify_incoming(
            session,
            &req.target,
            IncomingCallNotice {
                caller_name: initiator.name.clone(),
                group_name,
            },
        )
        .await;
        self.to_group(
            &call.group_id,
            SignalEvent::GroupParticipantRecalled {
                call_id: call.call_id.clone(),
                group_id: call.group_id.clone(),
                user_id: req.target.clone(),
                by: user.clone(),
            },
        );
        self.to_user(
            &req.target,
            SignalEvent::GroupIncomingCall {
                call_id: call.call_id.clone(),
                group_id: call.group_id.clone(),
                initiator,
                call_type: session.call_type,
                channel: session.channel.clone(),
                participants: session.roster(),
            },
        );
        Ok(())
    }

    pub(super) fn check_group(session: &CallSession, group_id: &GroupId) -> Result<(), CallError> {
        if session.group_id.as_ref() != Some(group_id) {
            return Err(CallError::NotFound(format!(
                "call {} in group {}",
                session.id, group_id
            )));
        }
        Ok(())
    }

    fn initiator_summary(session: &CallSession) -> Result<ParticipantSummary, CallError> {
        session
            .initiator()
            .map(Participant::summary)
            .ok_or_else(|| CallError::NotFound(format!("initiator of call {}", session.id)))
    }

    async fn cancel_locked(&self, record: &mut CallRecord, reason: EndReason) -> Result<(), CallError> {
        record.session.finish_from(
            &UNANSWERED,
            SessionStatus::Cancelled,
            Some(reason.clone()),
            Utc::now(),
        )?;
        record.disarm_timeout();
        let session = &record.session;
        self.release_all(session);
        self.close_all_notifications(session).await;
        self.group_terminal(
            session,
            SignalEvent::GroupCallCancelled {
                call_id: session.id.clone(),
                group_id: Self::group_of(session)?,
                reason: Some(reason),
            },
        );
        Ok(())
    }

    async fn end_locked(
        &self,
        record: &mut CallRecord,
        ended_by: &UserId,
        reason: EndReason,
    ) -> Result<(), CallError> {
        record
            .session
            .finish(SessionStatus::Ended, Some(reason.clone()), Utc::now())?;
        record.disarm_timeout();
        let session = &record.session;
        self.release_all(session);
        self.close_all_notifications(session).await;
        self.group_terminal(
            session,
            SignalEvent::GroupCallEnded {
                call_id: session.id.clone(),
                group_id: Self::group_of(session)?,
                ended_by: Some(ended_by.clone()),
                reason: Some(reason),
                duration_seconds: session.duration_seconds,
            },
        );
        Ok(())
    }

    fn group_of(session: &CallSession) -> Result<GroupId, CallError> {
        session
            .group_id
            .clone()
            .ok_or_else(|| CallError::Validation(format!("call {} has no group", session.id)))
    }
}
