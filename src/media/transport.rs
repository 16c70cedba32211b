//! Media transport contract and an in-process loopback implementation.
//!
//! Only the join/publish/subscribe/leave surface of a real-time media SDK is
//! modelled. [`LoopbackNetwork`] lets several [`LoopbackTransport`]s share
//! rooms so the demo and the integration tests can run real calls, and
//! [`LoopbackScript`] injects the failures the session manager must survive.

use async_trait::async_trait;
use callcore::TransportError;
use callcore::api::MediaCredential;
use callcore::types::ChannelId;
use dashmap::DashMap;
use log::debug;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Room notifications. Presence and media availability arrive separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ParticipantJoined { uid: u32 },
    ParticipantPublished { uid: u32, kind: MediaKind },
    ParticipantLeft { uid: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub uid: u32,
    pub kind: MediaKind,
    pub id: u64,
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn connection_state(&self) -> ConnectionState;

    async fn join(
        &self,
        channel: &ChannelId,
        credential: &MediaCredential,
    ) -> Result<(), TransportError>;

    async fn leave(&self) -> Result<(), TransportError>;

    async fn create_local_audio(&self) -> Result<LocalTrack, TransportError>;

    async fn publish(&self, track: &LocalTrack) -> Result<(), TransportError>;

    async fn close_local(&self, track: &LocalTrack) -> Result<(), TransportError>;

    async fn set_muted(&self, track: &LocalTrack, muted: bool) -> Result<(), TransportError>;

    async fn subscribe(&self, uid: u32, kind: MediaKind) -> Result<RemoteTrack, TransportError>;

    async fn unsubscribe(&self, track: &RemoteTrack) -> Result<(), TransportError>;

    /// Remote uids currently present in the joined room.
    fn remote_participants(&self) -> Vec<u32>;

    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Builds a fresh transport client when the current one is stuck.
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Arc<dyn MediaTransport>;
}

struct RoomMember {
    events: broadcast::Sender<TransportEvent>,
    publishing: bool,
}

/// Shared "server side" of the loopback transports.
#[derive(Default)]
pub struct LoopbackNetwork {
    rooms: DashMap<ChannelId, HashMap<u32, RoomMember>>,
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackNetwork")
            .field("rooms", &self.rooms.len())
            .finish()
    }
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn members(&self, channel: &ChannelId) -> Vec<u32> {
        self.rooms
            .get(channel)
            .map(|room| room.keys().copied().collect())
            .unwrap_or_default()
    }

    fn enter(&self, channel: &ChannelId, uid: u32, events: broadcast::Sender<TransportEvent>) -> bool {
        let mut room = self.rooms.entry(channel.clone()).or_default();
        if room.contains_key(&uid) {
            return false;
        }
        for (other, member) in room.iter() {
            let _ = member.events.send(TransportEvent::ParticipantJoined { uid });
            let _ = events.send(TransportEvent::ParticipantJoined { uid: *other });
            if member.publishing {
                let _ = events.send(TransportEvent::ParticipantPublished {
                    uid: *other,
                    kind: MediaKind::Audio,
                });
            }
        }
        room.insert(
            uid,
            RoomMember {
                events,
                publishing: false,
            },
        );
        true
    }

    fn publish(&self, channel: &ChannelId, uid: u32) {
        if let Some(mut room) = self.rooms.get_mut(channel) {
            if let Some(me) = room.get_mut(&uid) {
                me.publishing = true;
            }
            for (other, member) in room.iter() {
                if *other != uid {
                    let _ = member.events.send(TransportEvent::ParticipantPublished {
                        uid,
                        kind: MediaKind::Audio,
                    });
                }
            }
        }
    }

    fn exit(&self, channel: &ChannelId, uid: u32) {
        if let Some(mut room) = self.rooms.get_mut(channel) {
            room.remove(&uid);
            for member in room.values() {
                let _ = member.events.send(TransportEvent::ParticipantLeft { uid });
            }
        }
        self.rooms.remove_if(channel, |_, room| room.is_empty());
    }

    fn is_publishing(&self, channel: &ChannelId, uid: u32) -> Option<bool> {
        self.rooms
            .get(channel)
            .and_then(|room| room.get(&uid).map(|m| m.publishing))
    }
}

/// Failure injection and counters shared by every transport a factory creates.
#[derive(Debug, Default)]
pub struct LoopbackScript {
    join_failures: Mutex<VecDeque<TransportError>>,
    subscribe_failures: Mutex<HashMap<u32, u32>>,
    any_subscribe_failures: AtomicU32,
    capture_fails: AtomicBool,
    stuck_on_leave: AtomicBool,
    join_delay_ms: AtomicU64,
    joins_started: AtomicU32,
    joins_in_flight: AtomicU32,
    max_joins_in_flight: AtomicU32,
    subscriptions: Mutex<HashMap<u32, u32>>,
    transports_created: AtomicU32,
}

impl LoopbackScript {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next joins fail with these errors, in order.
    pub fn fail_joins(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.join_failures.lock().unwrap().extend(errors);
    }

    /// The next `times` subscribe attempts for `uid` fail transiently.
    pub fn fail_subscribes(&self, uid: u32, times: u32) {
        self.subscribe_failures.lock().unwrap().insert(uid, times);
    }

    /// The next `times` subscribe attempts fail transiently, whoever they target.
    pub fn fail_any_subscribes(&self, times: u32) {
        self.any_subscribe_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_capture(&self, fails: bool) {
        self.capture_fails.store(fails, Ordering::SeqCst);
    }

    /// `leave` never reaches `Disconnected`, like a wedged SDK client.
    pub fn stick_on_leave(&self, stuck: bool) {
        self.stuck_on_leave.store(stuck, Ordering::SeqCst);
    }

    pub fn set_join_delay(&self, delay: Duration) {
        self.join_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn joins_started(&self) -> u32 {
        self.joins_started.load(Ordering::SeqCst)
    }

    pub fn max_joins_in_flight(&self) -> u32 {
        self.max_joins_in_flight.load(Ordering::SeqCst)
    }

    /// Successful subscriptions per remote uid, summed over all transports.
    pub fn subscriptions_to(&self, uid: u32) -> u32 {
        self.subscriptions
            .lock()
            .unwrap()
            .get(&uid)
            .copied()
            .unwrap_or(0)
    }

    pub fn transports_created(&self) -> u32 {
        self.transports_created.load(Ordering::SeqCst)
    }

    fn next_join_failure(&self) -> Option<TransportError> {
        self.join_failures.lock().unwrap().pop_front()
    }

    fn take_subscribe_failure(&self, uid: u32) -> bool {
        let mut failures = self.subscribe_failures.lock().unwrap();
        match failures.get_mut(&uid) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => self
                .any_subscribe_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok(),
        }
    }
}

struct Link {
    connection: ConnectionState,
    channel: Option<ChannelId>,
    uid: Option<u32>,
    local: HashSet<u64>,
    muted: bool,
}

pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    script: Arc<LoopbackScript>,
    link: Mutex<Link>,
    events: broadcast::Sender<TransportEvent>,
    next_track: AtomicU64,
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

impl LoopbackTransport {
    pub fn new(network: Arc<LoopbackNetwork>, script: Arc<LoopbackScript>) -> Self {
        Self {
            network,
            script,
            link: Mutex::new(Link {
                connection: ConnectionState::Disconnected,
                channel: None,
                uid: None,
                local: HashSet::new(),
                muted: false,
            }),
            events: broadcast::channel(EVENT_CAPACITY).0,
            next_track: AtomicU64::new(1),
        }
    }

    pub fn is_muted(&self) -> bool {
        self.link.lock().unwrap().muted
    }

    fn joined(&self) -> Result<(ChannelId, u32), TransportError> {
        let link = self.link.lock().unwrap();
        match (&link.connection, &link.channel, link.uid) {
            (ConnectionState::Connected, Some(channel), Some(uid)) => Ok((channel.clone(), uid)),
            _ => Err(TransportError::NotConnected),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.link.lock().unwrap().connection = state;
    }

    fn complete_join(&self, channel: &ChannelId, uid: u32) -> Result<(), TransportError> {
        if !self.network.enter(channel, uid, self.events.clone()) {
            self.set_state(ConnectionState::Disconnected);
            return Err(TransportError::UidConflict(uid));
        }
        let mut link = self.link.lock().unwrap();
        link.connection = ConnectionState::Connected;
        link.channel = Some(channel.clone());
        link.uid = Some(uid);
        Ok(())
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    fn connection_state(&self) -> ConnectionState {
        self.link.lock().unwrap().connection
    }

    async fn join(
        &self,
        channel: &ChannelId,
        credential: &MediaCredential,
    ) -> Result<(), TransportError> {
        let script = &self.script;
        script.joins_started.fetch_add(1, Ordering::SeqCst);
        let in_flight = script.joins_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        script
            .max_joins_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);
        let _in_flight = scopeguard::guard((), |_| {
            script.joins_in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        self.set_state(ConnectionState::Connecting);
        let delay = script.join_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        match script.next_join_failure() {
            // A newer join on this client won the race and is already connected.
            Some(TransportError::Superseded) => {
                self.complete_join(channel, credential.uid)?;
                Err(TransportError::Superseded)
            }
            Some(err) => {
                self.set_state(ConnectionState::Disconnected);
                Err(err)
            }
            None => {
                self.complete_join(channel, credential.uid)?;
                debug!("loopback: uid {} joined {}", credential.uid, channel);
                Ok(())
            }
        }
    }

    async fn leave(&self) -> Result<(), TransportError> {
        if self.script.stuck_on_leave.load(Ordering::SeqCst) {
            self.set_state(ConnectionState::Disconnecting);
            return Ok(());
        }
        let (channel, uid) = {
            let mut link = self.link.lock().unwrap();
            link.connection = ConnectionState::Disconnected;
            link.local.clear();
            (link.channel.take(), link.uid.take())
        };
        if let (Some(channel), Some(uid)) = (channel, uid) {
            self.network.exit(&channel, uid);
            debug!("loopback: uid {uid} left {channel}");
        }
        Ok(())
    }

    async fn create_local_audio(&self) -> Result<LocalTrack, TransportError> {
        if self.script.capture_fails.load(Ordering::SeqCst) {
            return Err(TransportError::Capture("no input device".into()));
        }
        let id = self.next_track.fetch_add(1, Ordering::SeqCst);
        self.link.lock().unwrap().local.insert(id);
        Ok(LocalTrack { id })
    }

    async fn publish(&self, track: &LocalTrack) -> Result<(), TransportError> {
        let (channel, uid) = self.joined()?;
        if !self.link.lock().unwrap().local.contains(&track.id) {
            return Err(TransportError::Other(format!("unknown track {}", track.id)));
        }
        self.network.publish(&channel, uid);
        Ok(())
    }

    async fn close_local(&self, track: &LocalTrack) -> Result<(), TransportError> {
        self.link.lock().unwrap().local.remove(&track.id);
        Ok(())
    }

    async fn set_muted(&self, track: &LocalTrack, muted: bool) -> Result<(), TransportError> {
        let mut link = self.link.lock().unwrap();
        if !link.local.contains(&track.id) {
            return Err(TransportError::Other(format!("unknown track {}", track.id)));
        }
        link.muted = muted;
        Ok(())
    }

    async fn subscribe(&self, uid: u32, kind: MediaKind) -> Result<RemoteTrack, TransportError> {
        let (channel, _) = self.joined()?;
        match self.network.is_publishing(&channel, uid) {
            None => return Err(TransportError::Network(format!("uid {uid} not in room"))),
            Some(false) => {
                return Err(TransportError::Network(format!(
                    "uid {uid} has not published yet"
                )));
            }
            Some(true) => {}
        }
        if self.script.take_subscribe_failure(uid) {
            return Err(TransportError::Network("media not ready".into()));
        }
        *self
            .script
            .subscriptions
            .lock()
            .unwrap()
            .entry(uid)
            .or_default() += 1;
        Ok(RemoteTrack {
            uid,
            kind,
            id: self.next_track.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn unsubscribe(&self, track: &RemoteTrack) -> Result<(), TransportError> {
        let mut subscriptions = self.script.subscriptions.lock().unwrap();
        if let Some(count) = subscriptions.get_mut(&track.uid) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }

    fn remote_participants(&self) -> Vec<u32> {
        let Ok((channel, me)) = self.joined() else {
            return Vec::new();
        };
        self.network
            .members(&channel)
            .into_iter()
            .filter(|uid| *uid != me)
            .collect()
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Creates loopback transports attached to one network and script.
#[derive(Debug, Clone)]
pub struct LoopbackFactory {
    network: Arc<LoopbackNetwork>,
    script: Arc<LoopbackScript>,
}

impl LoopbackFactory {
    pub fn new(network: Arc<LoopbackNetwork>, script: Arc<LoopbackScript>) -> Self {
        Self { network, script }
    }

    pub fn script(&self) -> &Arc<LoopbackScript> {
        &self.script
    }
}

impl TransportFactory for LoopbackFactory {
    fn create(&self) -> Arc<dyn MediaTransport> {
        self.script.transports_created.fetch_add(1, Ordering::SeqCst);
        Arc::new(LoopbackTransport::new(
            self.network.clone(),
            self.script.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(uid: u32) -> MediaCredential {
        MediaCredential {
            app_id: "test".into(),
            token: None,
            uid,
        }
    }

    #[tokio::test]
    async fn peers_see_each_other_and_published_media() {
        let network = LoopbackNetwork::new();
        let script = LoopbackScript::new();
        let a = LoopbackTransport::new(network.clone(), script.clone());
        let b = LoopbackTransport::new(network.clone(), script.clone());
        let channel = ChannelId::new("p-room");
        let mut a_events = a.events();

        a.join(&channel, &credential(1)).await.unwrap();
        b.join(&channel, &credential(2)).await.unwrap();
        assert_eq!(a.remote_participants(), vec![2]);
        assert_eq!(
            a_events.recv().await.unwrap(),
            TransportEvent::ParticipantJoined { uid: 2 }
        );

        // Present but not publishing yet.
        assert!(a.subscribe(2, MediaKind::Audio).await.is_err());
        let track = b.create_local_audio().await.unwrap();
        b.publish(&track).await.unwrap();
        assert_eq!(
            a_events.recv().await.unwrap(),
            TransportEvent::ParticipantPublished {
                uid: 2,
                kind: MediaKind::Audio
            }
        );
        a.subscribe(2, MediaKind::Audio).await.unwrap();
        assert_eq!(script.subscriptions_to(2), 1);

        b.leave().await.unwrap();
        assert_eq!(
            a_events.recv().await.unwrap(),
            TransportEvent::ParticipantLeft { uid: 2 }
        );
        assert!(a.remote_participants().is_empty());
    }

    #[tokio::test]
    async fn duplicate_uid_is_a_conflict() {
        let network = LoopbackNetwork::new();
        let script = LoopbackScript::new();
        let a = LoopbackTransport::new(network.clone(), script.clone());
        let b = LoopbackTransport::new(network, script);
        let channel = ChannelId::new("g-room");
        a.join(&channel, &credential(5)).await.unwrap();
        assert_eq!(
            b.join(&channel, &credential(5)).await,
            Err(TransportError::UidConflict(5))
        );
        assert_eq!(b.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn stuck_leave_never_disconnects() {
        let script = LoopbackScript::new();
        let t = LoopbackTransport::new(LoopbackNetwork::new(), script.clone());
        t.join(&ChannelId::new("x"), &credential(1)).await.unwrap();
        script.stick_on_leave(true);
        t.leave().await.unwrap();
        assert_eq!(t.connection_state(), ConnectionState::Disconnecting);
    }
}
