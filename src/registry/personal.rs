use callcore::CallError;
use callcore::api::{AnswerPersonal, EndPersonal, InvitePersonal, InviteReceipt, MissedReport};
use callcore::events::SignalEvent;
use callcore::notification::IncomingCallNotice;
use callcore::types::{
    CallId, CallKind, CallSession, EndReason, Participant, ParticipantStatus, SessionStatus,
    UserId,
};
use chrono::Utc;
use log::info;

use super::CallRegistry;

const UNANSWERED: [SessionStatus; 2] = [SessionStatus::Calling, SessionStatus::Ringing];

impl CallRegistry {
    /// `caller` invites `req.callee_id`. Fails with `Busy` if either side is already in a call.
    pub async fn create_personal(
        &self,
        caller: &UserId,
        req: InvitePersonal,
    ) -> Result<InviteReceipt, CallError> {
        req.validate(caller)?;
        let caller_info = self
            .directory
            .user(caller)
            .ok_or_else(|| CallError::NotFound(format!("user {caller}")))?;
        let callee_info = self
            .directory
            .user(&req.callee_id)
            .ok_or_else(|| CallError::NotFound(format!("user {}", req.callee_id)))?;

        let now = Utc::now();
        let session = CallSession::new_personal(
            Participant::initiator(caller.clone(), caller_info.display_name.clone(), now),
            Participant::invitee(req.callee_id.clone(), callee_info.display_name),
            req.call_type,
            now,
        );
        let call_id = session.id.clone();
        self.engage(caller, &call_id)?;
        if let Err(e) = self.engage(&req.callee_id, &call_id) {
            self.release(caller, &call_id);
            return Err(e);
        }

        let record = self.insert(session);
        let mut guard = record.lock().await;
        self.arm_timeout(&mut guard);
        let session = &guard.session;
        info!(
            "call {} created: {} -> {} ({:?})",
            call_id, caller, req.callee_id, req.call_type
        );

        self.notify_incoming(
            session,
            &req.callee_id,
            IncomingCallNotice {
                caller_name: caller_info.display_name,
                group_name: None,
            },
        )
        .await;
        let caller_summary = session
            .participant(caller)
            .map(Participant::summary)
            .ok_or_else(|| CallError::NotFound(format!("user {caller}")))?;
        self.to_user(
            &req.callee_id,
            SignalEvent::IncomingCall {
                call_id: call_id.clone(),
                caller: caller_summary,
                call_type: session.call_type,
                channel: session.channel.clone(),
            },
        );

        Ok(InviteReceipt {
            call_id,
            channel: session.channel.clone(),
            status: session.status,
        })
    }

    /// The callee's client confirms the invite reached it.
    pub async fn ring_personal(&self, user: &UserId, call_id: &CallId) -> Result<(), CallError> {
        let record = self.record(call_id)?;
        let mut guard = self.lock_for(&record, CallKind::Personal, user).await?;
        let session = &mut guard.session;
        if session.is_initiator(user) {
            return Err(CallError::unauthorized(call_id, user));
        }
        session.compare_and_set(&[SessionStatus::Calling], SessionStatus::Ringing)?;
        session.set_participant_status(
            user,
            &[ParticipantStatus::Calling],
            ParticipantStatus::Ringing,
            Utc::now(),
        )?;
        if let Some(caller) = session.initiator() {
            self.to_user(
                &caller.user_id,
                SignalEvent::CallRinging {
                    call_id: call_id.clone(),
                },
            );
        }
        Ok(())
    }

    /// Only the callee answers; `req.caller_id` must name the initiator.
    pub async fn answer_personal(&self, user: &UserId, req: AnswerPersonal) -> Result<(), CallError> {
        let record = self.record(&req.call_id)?;
        let mut guard = self.lock_for(&record, CallKind::Personal, user).await?;
        if guard.session.is_initiator(user) {
            return Err(CallError::unauthorized(&req.call_id, user));
        }
        if !guard.session.is_initiator(&req.caller_id) {
            return Err(CallError::Validation(format!(
                "{} did not place call {}",
                req.caller_id, req.call_id
            )));
        }
        let now = Utc::now();

        if req.accepted {
            guard
                .session
                .compare_and_set(&UNANSWERED, SessionStatus::Accepted)?;
            guard.session.set_participant_status(
                user,
                &[ParticipantStatus::Calling, ParticipantStatus::Ringing],
                ParticipantStatus::Accepted,
                now,
            )?;
            guard.disarm_timeout();
            let session = &guard.session;
            info!("call {} accepted by {}", session.id, user);
            self.close_notification(session, user).await;
            self.to_user(
                &req.caller_id,
                SignalEvent::CallAccepted {
                    call_id: session.id.clone(),
                    by: user.clone(),
                },
            );
            for participant in session.participant_ids() {
                self.to_user(
                    &participant,
                    SignalEvent::CallStarted {
                        call_id: session.id.clone(),
                        channel: session.channel.clone(),
                    },
                );
            }
            return Ok(());
        }

        let reason = req.reason.unwrap_or(EndReason::Declined);
        guard.session.finish_from(
            &UNANSWERED,
            SessionStatus::Rejected,
            Some(reason.clone()),
            now,
        )?;
        if let Some(callee) = guard.session.participant_mut(user) {
            callee.status = ParticipantStatus::Rejected;
        }
        guard.disarm_timeout();
        let session = &guard.session;
        info!("call {} rejected by {} ({})", session.id, user, reason);
        self.release_all(session);
        self.close_all_notifications(session).await;
        for participant in session.participant_ids() {
            self.to_user(
                &participant,
                SignalEvent::CallRejected {
                    call_id: session.id.clone(),
                    by: user.clone(),
                    reason: Some(reason.clone()),
                },
            );
        }
        Ok(())
    }

    /// Hang up from any non-terminal status. Ending before an answer yields `ended` with no duration.
    pub async fn end_call(&self, user: &UserId, req: EndPersonal) -> Result<(), CallError> {
        req.validate()?;
        let record = self.record(&req.call_id)?;
        let mut guard = self.lock_for(&record, CallKind::Personal, user).await?;
        if let Some(stranger) = req
            .participant_ids
            .iter()
            .find(|id| !guard.session.is_participant(id))
        {
            return Err(CallError::Validation(format!(
                "{stranger} is not part of call {}",
                req.call_id
            )));
        }
        let reason = req.reason.unwrap_or(EndReason::Hangup);
        guard
            .session
            .finish(SessionStatus::Ended, Some(reason.clone()), Utc::now())?;
        guard.disarm_timeout();
        let session = &guard.session;
        info!(
            "call {} ended by {} ({}), duration {:?}s",
            session.id, user, reason, session.duration_seconds
        );
        self.release_all(session);
        self.close_all_notifications(session).await;
        for participant in session.participant_ids() {
            self.to_user(
                &participant,
                SignalEvent::CallEnded {
                    call_id: session.id.clone(),
                    ended_by: Some(user.clone()),
                    reason: Some(reason.clone()),
                    duration_seconds: session.duration_seconds,
                },
            );
        }
        Ok(())
    }

    /// The caller withdraws an invite nobody has answered yet.
    pub async fn cancel_personal(&self, user: &UserId, call_id: &CallId) -> Result<(), CallError> {
        let record = self.record(call_id)?;
        let mut guard = self.lock_for(&record, CallKind::Personal, user).await?;
        if !guard.session.is_initiator(user) {
            return Err(CallError::unauthorized(call_id, user));
        }
        guard.session.finish_from(
            &UNANSWERED,
            SessionStatus::Cancelled,
            Some(EndReason::Cancelled),
            Utc::now(),
        )?;
        guard.disarm_timeout();
        let session = &guard.session;
        info!("call {} cancelled by {}", session.id, user);
        self.release_all(session);
        self.close_all_notifications(session).await;
        for participant in session.participant_ids() {
            self.to_user(
                &participant,
                SignalEvent::CallCancelled {
                    call_id: session.id.clone(),
                },
            );
        }
        Ok(())
    }

    /// A client countdown ran out. Goes through the same path as the server timer,
    /// so only one of them produces `missed`.
    ///
    /// For group calls only the initiator's report ends the session; a member's
    /// report just closes that member's notification.
    pub async fn report_missed(&self, user: &UserId, req: MissedReport) -> Result<(), CallError> {
        let record = self.record(&req.call_id)?;
        let kind = if req.group_id.is_some() {
            CallKind::Group
        } else {
            CallKind::Personal
        };
        let mut guard = self.lock_for(&record, kind, user).await?;
        if let Some(group_id) = &req.group_id {
            Self::check_group(&guard.session, group_id)?;
            if !guard.session.is_initiator(user) {
                self.close_notification(&guard.session, user).await;
                return Ok(());
            }
        }
        self.expire(&mut guard).await?;
        info!("call {} missed, reported by {}", req.call_id, user);
        Ok(())
    }

    /// First successful media join moves `accepted -> connected`; later reports are conflicts.
    pub async fn report_connected(&self, user: &UserId, call_id: &CallId) -> Result<(), CallError> {
        let record = self.record(call_id)?;
        let mut guard = record.lock().await;
        if !guard.session.is_participant(user) {
            return Err(CallError::unauthorized(call_id, user));
        }
        guard.session.mark_connected(Utc::now())?;
        info!("call {call_id} connected");
        Ok(())
    }
}
