//! Server-authoritative call session store.
//!
//! Every mutation of one call runs under that call's mutex and is expressed as
//! a compare-and-set on [`SessionStatus`], so of two competing requests only
//! the first one changes state and broadcasts; the loser gets
//! [`CallError::Conflict`]. Broadcasts and notification updates are issued
//! while the lock is still held, which keeps the per-call event order equal to
//! the transition order.

mod group;
mod personal;

use callcore::api::{MediaCredential, MediaTokenRequest};
use callcore::events::{SignalEvent, Topic};
use callcore::notification::{IncomingCallNotice, NotificationKey};
use callcore::CallError;
use callcore::types::{
    CallId, CallKind, CallSession, ChannelId, EndReason, GroupId, SessionStatus, UserId,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::AbortHandle;

use crate::bus::SignalBus;
use crate::config::CallConfig;
use crate::directory::Directory;
use crate::notify::NotificationService;

pub(crate) struct CallRecord {
    pub(crate) session: CallSession,
    /// Ring window task; taken (and aborted) on the first acceptance or any terminal transition.
    timeout: Option<AbortHandle>,
}

impl CallRecord {
    fn new(session: CallSession) -> Self {
        Self {
            session,
            timeout: None,
        }
    }

    fn disarm_timeout(&mut self) {
        if let Some(handle) = self.timeout.take() {
            handle.abort();
        }
    }
}

pub struct CallRegistry {
    this: Weak<CallRegistry>,
    calls: DashMap<CallId, Arc<Mutex<CallRecord>>>,
    channels: DashMap<ChannelId, CallId>,
    /// Which call a user is currently engaged in, across both call kinds.
    engaged: DashMap<UserId, CallId>,
    bus: Arc<dyn SignalBus>,
    notifier: Arc<dyn NotificationService>,
    directory: Arc<dyn Directory>,
    config: CallConfig,
}

impl std::fmt::Debug for CallRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRegistry")
            .field("calls", &self.calls.len())
            .field("engaged", &self.engaged.len())
            .field("ring_timeout", &self.config.ring_timeout())
            .finish()
    }
}

impl CallRegistry {
    pub fn new(
        config: CallConfig,
        bus: Arc<dyn SignalBus>,
        notifier: Arc<dyn NotificationService>,
        directory: Arc<dyn Directory>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            calls: DashMap::new(),
            channels: DashMap::new(),
            engaged: DashMap::new(),
            bus,
            notifier,
            directory,
            config,
        })
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    /// Snapshot of one session, terminal or not.
    pub async fn session(&self, call_id: &CallId) -> Option<CallSession> {
        let record = self.calls.get(call_id).map(|r| r.value().clone())?;
        let guard = record.lock().await;
        Some(guard.session.clone())
    }

    /// Every session `user` took part in, newest first.
    pub async fn history_for(&self, user: &UserId) -> Vec<CallSession> {
        let mut sessions = Vec::new();
        for record in self.all_records() {
            let guard = record.lock().await;
            if guard.session.is_participant(user) {
                sessions.push(guard.session.clone());
            }
        }
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    /// Drops terminal sessions that ended more than `history_retention` before `now`.
    pub async fn prune_history(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.config.history_retention())
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut expired = Vec::new();
        for record in self.all_records() {
            let guard = record.lock().await;
            let session = &guard.session;
            if session.status.is_terminal()
                && session
                    .ended_at
                    .is_some_and(|ended| now.signed_duration_since(ended) > retention)
            {
                expired.push((session.id.clone(), session.channel.clone()));
            }
        }
        for (call_id, channel) in &expired {
            self.calls.remove(call_id);
            self.channels.remove(channel);
        }
        if !expired.is_empty() {
            debug!("pruned {} finished call(s)", expired.len());
        }
        expired.len()
    }

    /// The call `user` is currently engaged in, if any.
    pub fn active_call_for(&self, user: &UserId) -> Option<CallId> {
        self.engaged.get(user).map(|c| c.value().clone())
    }

    /// Issues a media-room credential to a participant of the live session owning `channel`.
    pub async fn media_token(
        &self,
        user: &UserId,
        req: MediaTokenRequest,
    ) -> Result<MediaCredential, CallError> {
        req.validate()?;
        let call_id = self
            .channels
            .get(&req.channel)
            .map(|c| c.value().clone())
            .ok_or_else(|| CallError::NotFound(format!("channel {}", req.channel)))?;
        let record = self.record(&call_id)?;
        let guard = record.lock().await;
        if guard.session.status.is_terminal() || !guard.session.is_participant(user) {
            return Err(CallError::unauthorized(&call_id, user));
        }
        drop(guard);

        let tokens = &self.config.tokens;
        let token = tokens.app_certificate.as_ref().map(|certificate| {
            let expires_at = Utc::now().timestamp() + tokens.ttl_secs as i64;
            let mut hasher = Sha256::new();
            hasher.update(tokens.app_id.as_bytes());
            hasher.update(certificate.as_bytes());
            hasher.update(req.channel.as_str().as_bytes());
            hasher.update(req.uid.to_be_bytes());
            hasher.update(expires_at.to_be_bytes());
            hex::encode(hasher.finalize())
        });
        debug!("issued media credential for {} uid {}", req.channel, req.uid);
        Ok(MediaCredential {
            app_id: tokens.app_id.clone(),
            token,
            uid: req.uid,
        })
    }

    fn all_records(&self) -> Vec<Arc<Mutex<CallRecord>>> {
        self.calls.iter().map(|r| r.value().clone()).collect()
    }

    fn record(&self, call_id: &CallId) -> Result<Arc<Mutex<CallRecord>>, CallError> {
        self.calls
            .get(call_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| CallError::NotFound(format!("call {call_id}")))
    }

    /// Locks the call and checks its kind and that `user` is one of its participants.
    async fn lock_for<'a>(
        &self,
        record: &'a Mutex<CallRecord>,
        kind: CallKind,
        user: &UserId,
    ) -> Result<MutexGuard<'a, CallRecord>, CallError> {
        let guard = record.lock().await;
        let session = &guard.session;
        if session.kind != kind {
            return Err(CallError::Validation(format!(
                "call {} is a {} call",
                session.id, session.kind
            )));
        }
        if !session.is_participant(user) {
            return Err(CallError::unauthorized(&session.id, user));
        }
        Ok(guard)
    }

    fn insert(&self, session: CallSession) -> Arc<Mutex<CallRecord>> {
        let record = Arc::new(Mutex::new(CallRecord::new(session.clone())));
        self.channels.insert(session.channel.clone(), session.id.clone());
        self.calls.insert(session.id.clone(), record.clone());
        record
    }

    /// Starts the ring window for a freshly created call.
    fn arm_timeout(&self, record: &mut CallRecord) {
        let registry = self.this.clone();
        let call_id = record.session.id.clone();
        let window = self.config.ring_timeout();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(registry) = registry.upgrade() {
                registry.on_ring_timeout(&call_id).await;
            }
        })
        .abort_handle();
        record.timeout = Some(handle);
    }

    async fn on_ring_timeout(&self, call_id: &CallId) {
        let Ok(record) = self.record(call_id) else {
            return;
        };
        let mut guard = record.lock().await;
        // Dropped rather than aborted: this is the task holding the handle.
        guard.timeout = None;
        match self.expire(&mut guard).await {
            Ok(()) => info!("call {call_id} missed: no answer within {:?}", self.config.ring_timeout()),
            Err(e) => debug!("ring timeout for {call_id} was stale: {e}"),
        }
    }

    /// Nobody answered: `calling|ringing -> missed`, shared by the server timer
    /// and client-side missed reports.
    async fn expire(&self, record: &mut CallRecord) -> Result<(), CallError> {
        record.session.finish_from(
            &[SessionStatus::Calling, SessionStatus::Ringing],
            SessionStatus::Missed,
            Some(EndReason::Timeout),
            Utc::now(),
        )?;
        record.disarm_timeout();
        let session = &record.session;
        self.release_all(session);
        self.close_all_notifications(session).await;
        match &session.group_id {
            Some(group_id) => self.group_terminal(
                session,
                SignalEvent::GroupCallMissed {
                    call_id: session.id.clone(),
                    group_id: group_id.clone(),
                },
            ),
            None => {
                for user in session.participant_ids() {
                    self.to_user(
                        &user,
                        SignalEvent::CallMissed {
                            call_id: session.id.clone(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Claims `user` for `call_id`. Re-claiming for the same call succeeds.
    fn engage(&self, user: &UserId, call_id: &CallId) -> Result<(), CallError> {
        match self.engaged.entry(user.clone()) {
            Entry::Occupied(entry) if entry.get() == call_id => Ok(()),
            Entry::Occupied(_) => Err(CallError::Busy(user.clone())),
            Entry::Vacant(entry) => {
                entry.insert(call_id.clone());
                Ok(())
            }
        }
    }

    fn release(&self, user: &UserId, call_id: &CallId) {
        self.engaged.remove_if(user, |_, engaged_in| engaged_in == call_id);
    }

    fn release_all(&self, session: &CallSession) {
        for participant in &session.participants {
            self.release(&participant.user_id, &session.id);
        }
    }

    fn notification_key(session: &CallSession, user: &UserId) -> NotificationKey {
        NotificationKey::new(session.id.clone(), session.kind, user.clone())
    }

    async fn notify_incoming(&self, session: &CallSession, user: &UserId, notice: IncomingCallNotice) {
        self.notifier
            .dispatch(Self::notification_key(session, user), notice)
            .await;
    }

    async fn close_notification(&self, session: &CallSession, user: &UserId) {
        self.notifier
            .close(&Self::notification_key(session, user))
            .await;
    }

    /// Closes every invitee's ticket; closing one that was never opened is a no-op.
    async fn close_all_notifications(&self, session: &CallSession) {
        for invitee in session.invitees() {
            self.close_notification(session, &invitee.user_id).await;
        }
    }

    /// Group terminal events also go to members still being rung, who may not
    /// be watching the group topic yet.
    fn group_terminal(&self, session: &CallSession, event: SignalEvent) {
        if let Some(group_id) = &session.group_id {
            self.to_group(group_id, event.clone());
        }
        for invitee in session.invitees().filter(|p| p.status.is_pending()) {
            self.to_user(&invitee.user_id, event.clone());
        }
    }

    fn to_user(&self, user: &UserId, event: SignalEvent) {
        self.bus.publish(Topic::User(user.clone()), event);
    }

    fn to_group(&self, group: &GroupId, event: SignalEvent) {
        self.bus.publish(Topic::Group(group.clone()), event);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bus::InMemorySignalBus;
    use crate::directory::InMemoryDirectory;
    use crate::notify::InMemoryNotificationCenter;
    use callcore::api::InvitePersonal;
    use callcore::events::Envelope;
    use callcore::types::CallType;
    use tokio::sync::broadcast;

    pub(crate) struct Harness {
        pub registry: Arc<CallRegistry>,
        pub bus: Arc<InMemorySignalBus>,
        pub notifications: Arc<InMemoryNotificationCenter>,
    }

    pub(crate) fn harness_with(config: CallConfig) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let directory = Arc::new(InMemoryDirectory::new());
        for (id, name) in [
            ("alice", "Alice"),
            ("bob", "Bob"),
            ("carol", "Carol"),
            ("dave", "Dave"),
            ("erin", "Erin"),
        ] {
            directory.add_user(id, name);
        }
        directory.add_group("team", "Team", &["alice", "bob", "carol", "dave"]);
        directory.add_group("pair", "Pair", &["alice", "erin"]);
        let bus = Arc::new(InMemorySignalBus::new());
        let notifications = Arc::new(InMemoryNotificationCenter::new());
        let registry = CallRegistry::new(config, bus.clone(), notifications.clone(), directory);
        Harness {
            registry,
            bus,
            notifications,
        }
    }

    pub(crate) fn harness() -> Harness {
        harness_with(CallConfig::default())
    }

    pub(crate) fn user(id: &str) -> UserId {
        UserId::new(id)
    }

    pub(crate) fn inbox(h: &Harness, id: &str) -> broadcast::Receiver<Envelope> {
        h.bus.subscribe(&Topic::User(user(id)))
    }

    pub(crate) fn drain(rx: &mut broadcast::Receiver<Envelope>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            names.push(envelope.event.name());
        }
        names
    }

    pub(crate) fn invite(callee: &str) -> InvitePersonal {
        InvitePersonal {
            callee_id: user(callee),
            call_type: CallType::Voice,
        }
    }

    #[tokio::test]
    async fn media_token_requires_live_participation() {
        let mut config = CallConfig::default();
        config.tokens.app_certificate = Some("cert".into());
        let h = harness_with(config);
        let receipt = h
            .registry
            .create_personal(&user("alice"), invite("bob"))
            .await
            .unwrap();

        let req = MediaTokenRequest {
            channel: receipt.channel.clone(),
            uid: 1001,
        };
        let credential = h.registry.media_token(&user("bob"), req.clone()).await.unwrap();
        assert_eq!(credential.uid, 1001);
        assert_eq!(credential.token.as_ref().map(String::len), Some(64));

        let err = h
            .registry
            .media_token(&user("carol"), req.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Unauthorized { .. }));

        h.registry
            .cancel_personal(&user("alice"), &receipt.call_id)
            .await
            .unwrap();
        assert!(h.registry.media_token(&user("bob"), req).await.is_err());
    }

    #[tokio::test]
    async fn permissive_mode_issues_null_token() {
        let h = harness();
        let receipt = h
            .registry
            .create_personal(&user("alice"), invite("bob"))
            .await
            .unwrap();
        let credential = h
            .registry
            .media_token(
                &user("alice"),
                MediaTokenRequest {
                    channel: receipt.channel,
                    uid: 7,
                },
            )
            .await
            .unwrap();
        assert_eq!(credential.token, None);
        assert_eq!(credential.app_id, "chatcall-dev");
    }

    #[tokio::test]
    async fn unknown_channel_is_not_found() {
        let h = harness();
        let err = h
            .registry
            .media_token(
                &user("alice"),
                MediaTokenRequest {
                    channel: ChannelId::new("p-nope"),
                    uid: 7,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::NotFound(_)));
    }

    #[tokio::test]
    async fn history_is_newest_first_and_prunable() {
        let h = harness();
        let first = h
            .registry
            .create_personal(&user("alice"), invite("bob"))
            .await
            .unwrap();
        h.registry
            .cancel_personal(&user("alice"), &first.call_id)
            .await
            .unwrap();
        let second = h
            .registry
            .create_personal(&user("alice"), invite("carol"))
            .await
            .unwrap();

        let history = h.registry.history_for(&user("alice")).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second.call_id);
        assert_eq!(h.registry.history_for(&user("bob")).await.len(), 1);

        let later = Utc::now() + chrono::Duration::days(2);
        assert_eq!(h.registry.prune_history(later).await, 1);
        assert!(h.registry.session(&first.call_id).await.is_none());
        // Still ringing, so not history yet.
        assert!(h.registry.session(&second.call_id).await.is_some());
    }
}
