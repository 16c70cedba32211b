//! Join/leave/subscribe orchestration for one call kind.
//!
//! One manager owns one transport client. Join sequences run one at a time: a
//! repeated join for the call already joining is turned away, while a join for
//! another call supersedes the running one and waits for it to unwind. Every
//! join and leave bumps an epoch, and sweeps, listeners and late join
//! completions compare their epoch against the current one at fire time
//! instead of being cancelled.

use callcore::api::MediaCredential;
use callcore::retry::RetryPolicy;
use callcore::types::{CallId, CallKind, ChannelId};
use callcore::{CallError, TransportError, TransportErrorClass};
use futures_util::future::join_all;
use log::{debug, info, warn};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::{Mutex, broadcast};
use tokio::task::AbortHandle;

use super::transport::{
    ConnectionState, LocalTrack, MediaKind, MediaTransport, RemoteTrack, TransportEvent,
    TransportFactory,
};
use crate::config::MediaConfig;
use crate::retry::retry_with_backoff;
use crate::signaling::CredentialSource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined { uid: u32, local_audio: bool },
    /// A join for the same call is still running on this manager.
    AlreadyJoining,
    /// A leave or a join for another call arrived while this join was in
    /// flight; the room was left again.
    Abandoned,
}

struct ActiveMedia {
    epoch: u64,
    call_id: CallId,
    channel: ChannelId,
    uid: u32,
    transport: Arc<dyn MediaTransport>,
    local: Option<LocalTrack>,
    muted: bool,
    subscribed: HashMap<u32, RemoteTrack>,
    in_flight: HashSet<u32>,
    listener: AbortHandle,
}

pub struct MediaSessionManager {
    this: Weak<MediaSessionManager>,
    kind: CallKind,
    config: MediaConfig,
    factory: Arc<dyn TransportFactory>,
    credentials: Arc<dyn CredentialSource>,
    transport: Mutex<Arc<dyn MediaTransport>>,
    /// Call and epoch of the newest join that has not finished yet.
    joining: StdMutex<Option<(CallId, u64)>>,
    /// Held for a whole join sequence.
    join_lock: Mutex<()>,
    epoch: AtomicU64,
    active: Mutex<Option<ActiveMedia>>,
}

impl std::fmt::Debug for MediaSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSessionManager")
            .field("kind", &self.kind)
            .field("joining", &self.pending_join())
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn random_uid() -> u32 {
    rand::rng().random_range(1..=u32::MAX)
}

fn is_transient(e: &CallError) -> bool {
    matches!(e, CallError::Transport(t) if t.class() == TransportErrorClass::Transient)
}

impl MediaSessionManager {
    pub fn new(
        kind: CallKind,
        config: MediaConfig,
        factory: Arc<dyn TransportFactory>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Arc<Self> {
        let transport = factory.create();
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            kind,
            config,
            factory,
            credentials,
            transport: Mutex::new(transport),
            joining: StdMutex::new(None),
            join_lock: Mutex::new(()),
            epoch: AtomicU64::new(0),
            active: Mutex::new(None),
        })
    }

    pub fn is_joining(&self) -> bool {
        self.pending_join().is_some()
    }

    /// The call whose join sequence is queued or running, if any.
    pub fn pending_join(&self) -> Option<CallId> {
        self.joining.lock().unwrap().as_ref().map(|(id, _)| id.clone())
    }

    /// The call currently holding the media room, if any.
    pub async fn current_call(&self) -> Option<CallId> {
        self.active.lock().await.as_ref().map(|a| a.call_id.clone())
    }

    /// Remote uids with a registered audio track.
    pub async fn subscribed(&self) -> Vec<u32> {
        let mut uids: Vec<u32> = self
            .active
            .lock()
            .await
            .as_ref()
            .map(|a| a.subscribed.keys().copied().collect())
            .unwrap_or_default();
        uids.sort_unstable();
        uids
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.transport.lock().await.connection_state()
    }

    /// Full join sequence: settle the transport, fetch a credential, join with
    /// retry, publish local audio and start subscribing to remote audio.
    ///
    /// Failing to publish audio is not an error. Exhausting the join retries is,
    /// and leaves signaling state to the caller.
    pub async fn join(&self, call_id: &CallId, channel: &ChannelId) -> Result<JoinOutcome, CallError> {
        let epoch = {
            let mut joining = self.joining.lock().unwrap();
            let current = self.epoch.load(Ordering::SeqCst);
            if joining.as_ref().is_some_and(|(id, e)| id == call_id && *e == current) {
                debug!("{} media: join for {} ignored, already in flight", self.kind, call_id);
                return Ok(JoinOutcome::AlreadyJoining);
            }
            // Supersedes any join still running for another call.
            let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            *joining = Some((call_id.clone(), epoch));
            epoch
        };
        let _joining = scopeguard::guard(&self.joining, move |joining| {
            let mut joining = joining.lock().unwrap();
            if joining.as_ref().is_some_and(|(_, e)| *e == epoch) {
                *joining = None;
            }
        });

        let _sequence = self.join_lock.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("{} media: join for {} superseded before it started", self.kind, call_id);
            return Ok(JoinOutcome::Abandoned);
        }
        info!("{} media: joining {} for call {}", self.kind, channel, call_id);

        self.teardown().await;
        let transport = self.settle().await;
        let events = transport.events();

        let uid = match retry_with_backoff(
            &self.config.join_retry,
            "media join",
            |_| self.join_once(&transport, channel),
            is_transient,
        )
        .await
        {
            Ok(uid) => uid,
            Err(e) => {
                if transport.connection_state() != ConnectionState::Disconnected {
                    let _ = transport.leave().await;
                }
                if self.epoch.load(Ordering::SeqCst) != epoch {
                    debug!("{} media: join for {} failed after it was superseded: {}", self.kind, call_id, e);
                    return Ok(JoinOutcome::Abandoned);
                }
                warn!("{} media: failed to connect to {}: {}", self.kind, channel, e);
                return Err(e);
            }
        };

        let local = self.publish_local_audio(&transport).await;
        let local_audio = local.is_some();

        // Checked under the lock so a concurrent leave either sees this session or wins.
        let mut active = self.active.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            drop(active);
            info!("{} media: call {} ended during join, leaving", self.kind, call_id);
            if let Some(track) = &local {
                let _ = transport.close_local(track).await;
            }
            if let Err(e) = transport.leave().await {
                warn!("{} media: leave after abandoned join failed: {}", self.kind, e);
            }
            return Ok(JoinOutcome::Abandoned);
        }
        let listener = self.spawn_listener(epoch, events);
        *active = Some(ActiveMedia {
            epoch,
            call_id: call_id.clone(),
            channel: channel.clone(),
            uid,
            transport: transport.clone(),
            local,
            muted: false,
            subscribed: HashMap::new(),
            in_flight: HashSet::new(),
            listener,
        });
        drop(active);
        info!("{} media: joined {} as uid {}", self.kind, channel, uid);

        // Presence and media availability are not simultaneous, so sweep as well.
        self.sweep(epoch, true).await;
        for delay in self.config.sweep_delays() {
            self.schedule_sweep(epoch, delay, true);
        }
        Ok(JoinOutcome::Joined { uid, local_audio })
    }

    /// Tears down whatever is joined. Errors are logged, never returned.
    pub async fn leave(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.teardown().await;
    }

    /// Leaves only if `call_id` still owns the room and no join for another
    /// call is queued behind it. Returns whether anything was torn down.
    pub async fn leave_call(&self, call_id: &CallId) -> bool {
        if self.pending_join().is_some_and(|id| &id != call_id) {
            debug!("{} media: not leaving {}, a newer join is pending", self.kind, call_id);
            return false;
        }
        if self.current_call().await.as_ref() != Some(call_id) {
            debug!("{} media: not leaving {}, it no longer holds the room", self.kind, call_id);
            return false;
        }
        self.leave().await;
        true
    }

    /// Mutes or unmutes the published local track; a no-op without one.
    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        let mut active = self.active.lock().await;
        let Some(media) = active.as_mut() else {
            return Ok(());
        };
        let Some(track) = &media.local else {
            return Ok(());
        };
        media.transport.set_muted(track, muted).await?;
        media.muted = muted;
        debug!("{} media: muted={}", self.kind, muted);
        Ok(())
    }

    pub async fn is_muted(&self) -> bool {
        self.active.lock().await.as_ref().is_some_and(|a| a.muted)
    }

    /// Waits for the transport to reach `Disconnected`, recreating it if it never does.
    async fn settle(&self) -> Arc<dyn MediaTransport> {
        let mut current = self.transport.lock().await;
        if current.connection_state() == ConnectionState::Disconnected {
            return current.clone();
        }
        if let Err(e) = current.leave().await {
            warn!("{} media: leave before join failed: {}", self.kind, e);
        }
        let policy = RetryPolicy::fixed(self.config.settle_attempts, self.config.settle_interval());
        let transport = current.clone();
        let settled = retry_with_backoff(
            &policy,
            "transport settle",
            |_| {
                let transport = transport.clone();
                async move {
                    match transport.connection_state() {
                        ConnectionState::Disconnected => Ok(()),
                        state => Err(TransportError::Other(format!("still {state:?}"))),
                    }
                }
            },
            |_| true,
        )
        .await;
        if let Err(e) = settled {
            warn!("{} media: transport did not settle ({}), recreating it", self.kind, e);
            *current = self.factory.create();
        }
        current.clone()
    }

    async fn credential(&self, channel: &ChannelId) -> Result<MediaCredential, CallError> {
        self.credentials.media_credential(channel, random_uid()).await
    }

    async fn join_once(
        &self,
        transport: &Arc<dyn MediaTransport>,
        channel: &ChannelId,
    ) -> Result<u32, CallError> {
        let credential = self.credential(channel).await?;
        let Err(e) = transport.join(channel, &credential).await else {
            return Ok(credential.uid);
        };
        match e.class() {
            TransportErrorClass::Superseded => {
                if transport.connection_state() == ConnectionState::Connected {
                    debug!("{} media: join superseded but connected, treating as joined", self.kind);
                    Ok(credential.uid)
                } else {
                    Err(TransportError::Network("superseded join left us disconnected".into()).into())
                }
            }
            TransportErrorClass::IdentifierConflict => {
                debug!("{} media: {}, retrying with a fresh uid", self.kind, e);
                let credential = self.credential(channel).await?;
                transport.join(channel, &credential).await?;
                Ok(credential.uid)
            }
            TransportErrorClass::Transient => Err(e.into()),
        }
    }

    async fn publish_local_audio(&self, transport: &Arc<dyn MediaTransport>) -> Option<LocalTrack> {
        let track = match transport.create_local_audio().await {
            Ok(track) => track,
            Err(e) => {
                warn!("{} media: no local audio, continuing without it: {}", self.kind, e);
                return None;
            }
        };
        if let Err(e) = transport.publish(&track).await {
            warn!("{} media: publishing local audio failed, continuing without it: {}", self.kind, e);
            let _ = transport.close_local(&track).await;
            return None;
        }
        Some(track)
    }

    fn spawn_listener(
        &self,
        epoch: u64,
        mut events: broadcast::Receiver<TransportEvent>,
    ) -> AbortHandle {
        let manager = self.this.clone();
        let handle = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("media listener lagged by {n} events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                if manager.epoch.load(Ordering::SeqCst) != epoch {
                    return;
                }
                match event {
                    TransportEvent::ParticipantJoined { uid }
                    | TransportEvent::ParticipantPublished {
                        uid,
                        kind: MediaKind::Audio,
                    } => {
                        manager.subscribe_one(epoch, uid).await;
                    }
                    TransportEvent::ParticipantPublished { .. } => {}
                    TransportEvent::ParticipantLeft { uid } => manager.forget(epoch, uid).await,
                }
            }
        });
        handle.abort_handle()
    }

    fn schedule_sweep(&self, epoch: u64, delay: std::time::Duration, follow_up: bool) {
        let manager = self.this.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = manager.upgrade() {
                manager.sweep(epoch, follow_up).await;
            }
        });
    }

    /// Tries every present, not yet subscribed participant in parallel. A sweep
    /// that had candidates but no success schedules one follow-up.
    async fn sweep(&self, epoch: u64, allow_follow_up: bool) {
        let candidates: Vec<u32> = {
            let active = self.active.lock().await;
            let Some(media) = active.as_ref().filter(|a| a.epoch == epoch) else {
                debug!("{} media: sweep after teardown, skipping", self.kind);
                return;
            };
            media
                .transport
                .remote_participants()
                .into_iter()
                .filter(|uid| !media.subscribed.contains_key(uid) && !media.in_flight.contains(uid))
                .collect()
        };
        if candidates.is_empty() {
            return;
        }
        debug!("{} media: sweeping {} participant(s)", self.kind, candidates.len());
        let results = join_all(candidates.iter().map(|uid| self.subscribe_one(epoch, *uid))).await;
        if allow_follow_up && !results.iter().any(|ok| *ok) {
            self.schedule_sweep(epoch, self.config.follow_up_sweep_delay(), false);
        }
    }

    /// Subscribes to `uid`'s audio unless it already is (or is being) subscribed.
    /// Returns whether a new track was registered.
    async fn subscribe_one(&self, epoch: u64, uid: u32) -> bool {
        let transport = {
            let mut active = self.active.lock().await;
            let Some(media) = active.as_mut().filter(|a| a.epoch == epoch) else {
                return false;
            };
            if media.subscribed.contains_key(&uid) || !media.in_flight.insert(uid) {
                debug!("{} media: uid {} already subscribed", self.kind, uid);
                return false;
            }
            media.transport.clone()
        };

        let result = retry_with_backoff(
            &self.config.subscribe_retry,
            "subscribe",
            |_| transport.subscribe(uid, MediaKind::Audio),
            |e| e.class() == TransportErrorClass::Transient,
        )
        .await;

        let mut active = self.active.lock().await;
        if !active.as_ref().is_some_and(|a| a.epoch == epoch) {
            drop(active);
            // Torn down while subscribing; do not leak the late track.
            if let Ok(track) = result {
                let _ = transport.unsubscribe(&track).await;
            }
            return false;
        }
        let Some(media) = active.as_mut() else {
            return false;
        };
        media.in_flight.remove(&uid);
        match result {
            Ok(track) => {
                info!("{} media: subscribed to uid {}", self.kind, uid);
                media.subscribed.insert(uid, track);
                true
            }
            Err(e) => {
                warn!("{} media: subscribe to uid {} failed: {}", self.kind, uid, e);
                false
            }
        }
    }

    async fn forget(&self, epoch: u64, uid: u32) {
        let removed = {
            let mut active = self.active.lock().await;
            active
                .as_mut()
                .filter(|a| a.epoch == epoch)
                .and_then(|media| media.subscribed.remove(&uid).map(|t| (media.transport.clone(), t)))
        };
        if let Some((transport, track)) = removed {
            debug!("{} media: uid {} left, dropping its track", self.kind, uid);
            if let Err(e) = transport.unsubscribe(&track).await {
                warn!("{} media: unsubscribe uid {} failed: {}", self.kind, uid, e);
            }
        }
    }

    /// Unsubscribes every remote track, closes the local one and leaves the room.
    async fn teardown(&self) {
        let media = self.active.lock().await.take();
        let transport = self.transport.lock().await.clone();
        if let Some(media) = media {
            media.listener.abort();
            for track in media.subscribed.values() {
                if let Err(e) = media.transport.unsubscribe(track).await {
                    warn!("{} media: unsubscribe uid {} failed: {}", self.kind, track.uid, e);
                }
            }
            if let Some(track) = &media.local
                && let Err(e) = media.transport.close_local(track).await
            {
                warn!("{} media: closing local track failed: {}", self.kind, e);
            }
            info!(
                "{} media: leaving {} (call {}, uid {})",
                self.kind, media.channel, media.call_id, media.uid
            );
        }
        if transport.connection_state() != ConnectionState::Disconnected
            && let Err(e) = transport.leave().await
        {
            warn!("{} media: leave failed: {}", self.kind, e);
        }
    }
}
