#![allow(dead_code)]

use callcore::CallError;
use callcore::events::{Envelope, Topic};
use callcore::fsm::{ActiveCall, CallUpdate};
use callcore::types::{CallId, SessionStatus, UserId};
use chatcall::bus::InMemorySignalBus;
use chatcall::controller::CallObserver;
use chatcall::directory::InMemoryDirectory;
use chatcall::media::{LoopbackFactory, LoopbackNetwork, LoopbackScript};
use chatcall::notify::InMemoryNotificationCenter;
use chatcall::registry::CallRegistry;
use chatcall::{CallConfig, ClientSession};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Everything an observer was told, in order.
#[derive(Default)]
pub struct RecordingObserver {
    incoming: Mutex<Vec<CallId>>,
    updates: Mutex<Vec<CallUpdate>>,
    media_failures: Mutex<Vec<CallId>>,
}

impl RecordingObserver {
    pub fn incoming(&self) -> Vec<CallId> {
        self.incoming.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<CallUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn media_failures(&self) -> Vec<CallId> {
        self.media_failures.lock().unwrap().clone()
    }

    /// Terminal statuses reported for `call_id`.
    pub fn finished(&self, call_id: &CallId) -> Vec<SessionStatus> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter_map(|update| match update {
                CallUpdate::Finished {
                    call_id: id,
                    status,
                    ..
                } if id == call_id => Some(*status),
                _ => None,
            })
            .collect()
    }
}

impl CallObserver for RecordingObserver {
    fn on_incoming_call(&self, call: &ActiveCall) {
        self.incoming.lock().unwrap().push(call.call_id.clone());
    }

    fn on_call_updated(&self, update: &CallUpdate) {
        self.updates.lock().unwrap().push(update.clone());
    }

    fn on_media_failed(&self, call_id: &CallId, _error: &CallError) {
        self.media_failures.lock().unwrap().push(call_id.clone());
    }
}

pub struct Client {
    pub session: ClientSession,
    pub script: Arc<LoopbackScript>,
    pub observer: Arc<RecordingObserver>,
}

impl Client {
    pub fn id(&self) -> UserId {
        self.session.user_id().clone()
    }
}

/// One registry and bus shared by any number of in-process clients.
pub struct World {
    pub config: CallConfig,
    pub bus: Arc<InMemorySignalBus>,
    pub notifications: Arc<InMemoryNotificationCenter>,
    pub registry: Arc<CallRegistry>,
    pub network: Arc<LoopbackNetwork>,
}

impl World {
    pub fn new() -> Self {
        Self::with_config(CallConfig::default())
    }

    /// Users alice, bob, carol and dave; group "team" holds all four.
    pub fn with_config(config: CallConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let directory = InMemoryDirectory::new();
        for (id, name) in [
            ("alice", "Alice"),
            ("bob", "Bob"),
            ("carol", "Carol"),
            ("dave", "Dave"),
        ] {
            directory.add_user(id, name);
        }
        directory.add_group("team", "Team", &["alice", "bob", "carol", "dave"]);

        let bus = Arc::new(InMemorySignalBus::new());
        let notifications = Arc::new(InMemoryNotificationCenter::new());
        let registry = CallRegistry::new(
            config.clone(),
            bus.clone(),
            notifications.clone(),
            Arc::new(directory),
        );
        Self {
            config,
            bus,
            notifications,
            registry,
            network: LoopbackNetwork::new(),
        }
    }

    /// A started client session for `name` with its own failure script.
    pub fn client(&self, name: &str) -> Client {
        let script = LoopbackScript::new();
        let observer = Arc::new(RecordingObserver::default());
        let session = ClientSession::in_process(
            &self.config,
            UserId::new(name),
            self.registry.clone(),
            self.bus.clone(),
            Arc::new(LoopbackFactory::new(self.network.clone(), script.clone())),
            observer.clone(),
        );
        session.start();
        Client {
            session,
            script,
            observer,
        }
    }

    pub fn listen(&self, name: &str) -> broadcast::Receiver<Envelope> {
        use chatcall::bus::SignalBus;
        self.bus.subscribe(&Topic::User(UserId::new(name)))
    }

    pub async fn status(&self, call_id: &CallId) -> SessionStatus {
        self.registry
            .session(call_id)
            .await
            .map(|s| s.status)
            .expect("unknown call")
    }
}

/// Event names received so far.
pub fn drain(rx: &mut broadcast::Receiver<Envelope>) -> Vec<&'static str> {
    let mut names = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        names.push(envelope.event.name());
    }
    names
}

/// Lets spawned tasks (bus listeners, joins, sweeps) run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
