//! One signed-in user's calling context.
//!
//! A [`ClientSession`] owns both call controllers and their media managers
//! and feeds them from the user's signaling topic. The embedding application
//! creates one per signed-in user and hands it to whatever needs to place or
//! answer calls; nothing here is process-global.

use callcore::events::Topic;
use callcore::types::{CallKind, UserId};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;

use crate::bus::SignalBus;
use crate::config::CallConfig;
use crate::controller::{CallObserver, GroupCallController, PersonalCallController};
use crate::media::{MediaSessionManager, TransportFactory};
use crate::registry::CallRegistry;
use crate::signaling::{CredentialSource, InProcessSignaling, SignalingClient};

pub struct ClientSession {
    user: UserId,
    signaling: Arc<dyn SignalingClient>,
    personal: Arc<PersonalCallController>,
    group: Arc<GroupCallController>,
    started: AtomicBool,
    listener: Mutex<Option<AbortHandle>>,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("user", &self.user)
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    pub fn new(
        config: &CallConfig,
        signaling: Arc<dyn SignalingClient>,
        credentials: Arc<dyn CredentialSource>,
        transports: Arc<dyn TransportFactory>,
        observer: Arc<dyn CallObserver>,
    ) -> Self {
        let media = |kind| {
            MediaSessionManager::new(
                kind,
                config.media.clone(),
                transports.clone(),
                credentials.clone(),
            )
        };
        let personal = PersonalCallController::new(
            config,
            signaling.clone(),
            media(CallKind::Personal),
            observer.clone(),
        );
        let group = GroupCallController::new(
            config,
            signaling.clone(),
            media(CallKind::Group),
            observer,
        );
        Self {
            user: signaling.user_id().clone(),
            signaling,
            personal: Arc::new(personal),
            group: Arc::new(group),
            started: AtomicBool::new(false),
            listener: Mutex::new(None),
        }
    }

    /// Wires a session straight to a registry living in this process.
    pub fn in_process(
        config: &CallConfig,
        user: UserId,
        registry: Arc<CallRegistry>,
        bus: Arc<dyn SignalBus>,
        transports: Arc<dyn TransportFactory>,
        observer: Arc<dyn CallObserver>,
    ) -> Self {
        let signaling = Arc::new(InProcessSignaling::new(user, registry, bus));
        Self::new(config, signaling.clone(), signaling, transports, observer)
    }

    pub fn user_id(&self) -> &UserId {
        &self.user
    }

    pub fn personal(&self) -> &PersonalCallController {
        &self.personal
    }

    pub fn group(&self) -> &GroupCallController {
        &self.group
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Subscribes to the user's topic and starts routing events to the
    /// controllers. Only the first call does anything; returns whether it was
    /// this one.
    pub fn start(&self) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("session for {} already started", self.user);
            return false;
        }
        let mut events = self.signaling.subscribe(&Topic::User(self.user.clone()));
        let personal = Arc::downgrade(&self.personal);
        let group = Arc::downgrade(&self.group);
        let user = self.user.clone();
        let handle = tokio::spawn(async move {
            loop {
                let envelope = match events.recv().await {
                    Ok(envelope) => envelope,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("signaling for {user} lagged by {n} events");
                        if let Some(personal) = personal.upgrade() {
                            personal.resync().await;
                        }
                        if let Some(group) = group.upgrade() {
                            group.resync().await;
                        }
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let event = envelope.event;
                debug!("{} <- {} for call {}", user, event.name(), event.call_id());
                if event.is_group() {
                    let Some(group) = group.upgrade() else { return };
                    group.handle_signal(event).await;
                } else {
                    let Some(personal) = personal.upgrade() else { return };
                    personal.handle_signal(event).await;
                }
            }
        });
        *self.listener.lock().unwrap() = Some(handle.abort_handle());
        info!("call session started for {}", self.user);
        true
    }

    /// Leaves any call in progress and stops listening.
    pub async fn shutdown(&self) {
        if let Err(e) = self.personal.hang_up().await {
            warn!("hang up on shutdown failed: {e}");
        }
        if let Err(e) = self.group.leave().await {
            warn!("group leave on shutdown failed: {e}");
        }
        if let Some(listener) = self.listener.lock().unwrap().take() {
            listener.abort();
        }
        info!("call session for {} shut down", self.user);
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.listener.lock()
            && let Some(listener) = slot.take()
        {
            listener.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemorySignalBus;
    use crate::controller::NoopObserver;
    use crate::directory::InMemoryDirectory;
    use crate::media::{LoopbackFactory, LoopbackNetwork, LoopbackScript};
    use crate::notify::InMemoryNotificationCenter;
    use callcore::types::CallType;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn start_subscribes_once() {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = CallConfig::default();
        let bus = Arc::new(InMemorySignalBus::new());
        let directory = InMemoryDirectory::new();
        directory.add_user("alice", "Alice");
        directory.add_user("bob", "Bob");
        let registry = CallRegistry::new(
            config.clone(),
            bus.clone(),
            Arc::new(InMemoryNotificationCenter::new()),
            Arc::new(directory),
        );
        let transports = Arc::new(LoopbackFactory::new(
            LoopbackNetwork::new(),
            LoopbackScript::new(),
        ));
        let session = |name: &str| {
            ClientSession::in_process(
                &config,
                UserId::new(name),
                registry.clone(),
                bus.clone(),
                transports.clone(),
                Arc::new(NoopObserver),
            )
        };
        let alice = session("alice");
        let bob = session("bob");
        assert!(bob.start());
        assert!(!bob.start());
        assert!(bob.is_started());
        alice.start();

        alice
            .personal()
            .invite(UserId::new("bob"), CallType::Voice)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // A second subscription would have delivered the ring twice; the
        // controller state would still be one call, so count the topic instead.
        assert_eq!(bus.subscriber_count(&Topic::User(UserId::new("bob"))), 1);
        assert!(bob.personal().current_call().await.is_some());
    }
}
