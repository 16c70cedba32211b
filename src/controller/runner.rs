use callcore::CallError;
use callcore::api::{GroupCallRef, MissedReport};
use callcore::events::{SignalEvent, Topic};
use callcore::fsm::{ControllerState, Effect, Input, Phase, Step, step};
use callcore::types::{CallId, CallKind, ChannelId, GroupId, UserId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tokio::task::AbortHandle;

use super::CallObserver;
use super::countdown::Countdown;
use super::debounce::Debouncer;
use crate::config::CallConfig;
use crate::media::{JoinOutcome, MediaSessionManager};
use crate::signaling::SignalingClient;

/// How many finished call ids are remembered for dropping late deliveries.
const FINISHED_MEMORY: usize = 32;

/// State plus effect runner shared by both controller kinds.
///
/// Inputs are applied under the state lock and their effects run before the
/// lock is released, so effects of consecutive inputs never interleave. The
/// media join is the exception: it is spawned and reports back through
/// [`ControllerCore::apply`].
pub(crate) struct ControllerCore {
    this: Weak<ControllerCore>,
    kind: CallKind,
    state: Mutex<ControllerState>,
    signaling: Arc<dyn SignalingClient>,
    media: Arc<MediaSessionManager>,
    observer: Arc<dyn CallObserver>,
    countdown: Countdown,
    debouncer: Debouncer,
    ring_timeout: Duration,
    // Bumped on every media leave; a join that completes under an older value is stale.
    media_generation: AtomicU64,
    finished: std::sync::Mutex<VecDeque<CallId>>,
    watched: DashMap<GroupId, AbortHandle>,
}

impl std::fmt::Debug for ControllerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerCore")
            .field("kind", &self.kind)
            .field("user", self.signaling.user_id())
            .field("countdown", &self.countdown)
            .finish_non_exhaustive()
    }
}

impl Drop for ControllerCore {
    fn drop(&mut self) {
        for watcher in self.watched.iter() {
            watcher.value().abort();
        }
    }
}

impl ControllerCore {
    pub(crate) fn new(
        kind: CallKind,
        config: &CallConfig,
        signaling: Arc<dyn SignalingClient>,
        media: Arc<MediaSessionManager>,
        observer: Arc<dyn CallObserver>,
    ) -> Arc<Self> {
        let state = ControllerState::idle(signaling.user_id().clone(), kind);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            kind,
            state: Mutex::new(state),
            signaling,
            media,
            observer,
            countdown: Countdown::new(),
            debouncer: Debouncer::new(config.notification_debounce()),
            ring_timeout: config.ring_timeout(),
            media_generation: AtomicU64::new(0),
            finished: std::sync::Mutex::new(VecDeque::new()),
            watched: DashMap::new(),
        })
    }

    pub(crate) fn user(&self) -> &UserId {
        self.signaling.user_id()
    }

    pub(crate) fn signaling(&self) -> &Arc<dyn SignalingClient> {
        &self.signaling
    }

    pub(crate) fn media(&self) -> &Arc<MediaSessionManager> {
        &self.media
    }

    pub(crate) async fn snapshot(&self) -> ControllerState {
        self.state.lock().await.clone()
    }

    /// Holds the state across a signaling round trip so events caused by the
    /// request are applied after its local transition.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().await
    }

    pub(crate) fn countdown_armed(&self) -> Option<CallId> {
        self.countdown.armed_for()
    }

    pub(crate) fn is_watching(&self, group_id: &GroupId) -> bool {
        self.watched.contains_key(group_id)
    }

    /// Catches up after signaling deliveries were dropped: if the registry has
    /// already finished the current call, applies its terminal event.
    pub(crate) async fn resync(&self) -> bool {
        let Some(call_id) = self.state.lock().await.call_id().cloned() else {
            return false;
        };
        let session = match self.signaling.session(&call_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!("resync of call {} failed: {}", call_id, e);
                return false;
            }
        };
        let Some(event) = SignalEvent::terminal_for(&session) else {
            debug!("call {} still {} after resync", call_id, session.status);
            return false;
        };
        info!("call {} became {} while deliveries were lost", call_id, session.status);
        self.apply(Input::Signal(event)).await
    }

    pub(crate) fn apply(&self, input: Input) -> BoxFuture<'_, bool> {
        async move {
            let mut state = self.state.lock().await;
            self.apply_locked(&mut state, input).await
        }
        .boxed()
    }

    /// Steps the state machine and runs the resulting effects. Returns false
    /// when the input was dropped as stale, duplicate or unrelated.
    pub(crate) fn apply_locked<'a>(
        &'a self,
        state: &'a mut ControllerState,
        input: Input,
    ) -> BoxFuture<'a, bool> {
        async move {
            if let Input::Signal(event) = &input
                && !matches!(event, SignalEvent::GroupIncomingCall { .. })
                && self.was_finished(event.call_id())
            {
                debug!(
                    "{} controller for {}: dropping {} for finished call {}",
                    self.kind,
                    self.user(),
                    event.name(),
                    event.call_id()
                );
                return false;
            }

            let mut queue = VecDeque::from([input]);
            let mut applied = false;
            while let Some(input) = queue.pop_front() {
                let (next, effects) = match step(state, &input) {
                    Step::Applied { next, effects } => (next, effects),
                    Step::Ignored(why) => {
                        debug!("{} controller for {}: ignored input ({why})", self.kind, self.user());
                        continue;
                    }
                };
                applied = true;
                if next.phase() != state.phase() || next.call_id() != state.call_id() {
                    info!(
                        "{} controller for {}: {:?} -> {:?}",
                        self.kind,
                        self.user(),
                        state.phase(),
                        next.phase()
                    );
                }
                match (state.call_id(), next.call_id()) {
                    (Some(done), None) => self.remember_finished(done.clone()),
                    (_, Some(current)) => self.forget_finished(current),
                    (None, None) => {}
                }
                *state = next;
                for effect in effects {
                    if let Some(follow_up) = self.run(effect).await {
                        queue.push_back(follow_up);
                    }
                }
            }
            applied
        }
        .boxed()
    }

    async fn run(&self, effect: Effect) -> Option<Input> {
        match effect {
            Effect::StartCountdown { call_id } => {
                let core = self.this.clone();
                self.countdown
                    .start(call_id, self.ring_timeout, move |call_id| async move {
                        if let Some(core) = core.upgrade() {
                            core.apply(Input::CountdownExpired { call_id }).await;
                        }
                    });
                None
            }
            Effect::CancelCountdown => {
                self.countdown.cancel();
                None
            }
            Effect::AcknowledgeRing { call_id, group_id } => {
                let acked = match group_id {
                    None => self.signaling.ring_personal(&call_id).await,
                    Some(group_id) => {
                        self.signaling
                            .ring_group(&GroupCallRef::new(call_id.clone(), group_id))
                            .await
                    }
                };
                match acked {
                    Ok(()) => None,
                    // The call was over before we could ring; drop it locally.
                    Err(e @ (CallError::Conflict(_) | CallError::NotFound(_))) => {
                        info!("ring for {} is stale ({}), dropping it", call_id, e);
                        Some(Input::HungUp { call_id })
                    }
                    Err(e) => {
                        warn!("failed to acknowledge ring for {}: {}", call_id, e);
                        None
                    }
                }
            }
            Effect::NotifyIncoming { call_id } => {
                let core = self.this.clone();
                self.debouncer.trigger(call_id.clone(), move || async move {
                    if let Some(core) = core.upgrade() {
                        core.notify_if_ringing(&call_id).await;
                    }
                });
                None
            }
            Effect::DismissNotification { call_id } => {
                self.debouncer.cancel(&call_id);
                None
            }
            Effect::JoinMedia { call_id, channel } => {
                self.spawn_join(call_id, channel);
                None
            }
            Effect::LeaveMedia => {
                self.media_generation.fetch_add(1, Ordering::SeqCst);
                self.media.leave().await;
                None
            }
            Effect::ReportMissed { call_id, group_id } => {
                if let Err(e) = self
                    .signaling
                    .report_missed(MissedReport::timeout(call_id.clone(), group_id))
                    .await
                    && !e.is_conflict()
                {
                    warn!("failed to report missed call {}: {}", call_id, e);
                }
                None
            }
            Effect::ReportConnected { call_id, .. } => {
                match self.signaling.report_connected(&call_id).await {
                    Ok(()) => {}
                    Err(e) if e.is_conflict() => {
                        debug!("call {} already marked connected", call_id);
                    }
                    Err(e) => warn!("failed to report call {} connected: {}", call_id, e),
                }
                None
            }
            Effect::WatchGroup { group_id } => {
                self.watch_group(group_id);
                None
            }
            Effect::Publish(update) => {
                self.observer.on_call_updated(&update);
                None
            }
        }
    }

    async fn notify_if_ringing(&self, call_id: &CallId) {
        let state = self.state.lock().await;
        match &state.call {
            Some(call) if &call.call_id == call_id && call.phase == Phase::Ringing => {
                self.observer.on_incoming_call(call);
            }
            _ => debug!("incoming notification for {} no longer applies", call_id),
        }
    }

    fn spawn_join(&self, call_id: CallId, channel: ChannelId) {
        let generation = self.media_generation.load(Ordering::SeqCst);
        let core = self.this.clone();
        tokio::spawn(async move {
            let Some(core) = core.upgrade() else {
                return;
            };
            let outcome = core.media.join(&call_id, &channel).await;
            let mut state = core.state.lock().await;
            let current = core.media_generation.load(Ordering::SeqCst) == generation
                && state.call_id() == Some(&call_id);
            match outcome {
                Ok(JoinOutcome::Joined { .. }) if current => {
                    core.apply_locked(&mut state, Input::MediaConnected { call_id })
                        .await;
                }
                Ok(JoinOutcome::Joined { .. }) => {
                    drop(state);
                    info!("call {} finished while media was joining, leaving", call_id);
                    core.media.leave_call(&call_id).await;
                }
                Ok(JoinOutcome::AlreadyJoining) => {
                    debug!("media join for {} skipped, it is already running", call_id);
                }
                Ok(JoinOutcome::Abandoned) => {
                    debug!("media join for {} abandoned", call_id);
                }
                Err(e) => {
                    warn!("media join for call {} failed: {}", call_id, e);
                    core.observer.on_media_failed(&call_id, &e);
                    if current {
                        core.apply_locked(&mut state, Input::MediaFailed { call_id })
                            .await;
                    }
                }
            }
        });
    }

    /// Forwards the group topic into this controller. Installed once per group.
    fn watch_group(&self, group_id: GroupId) {
        let Entry::Vacant(slot) = self.watched.entry(group_id.clone()) else {
            return;
        };
        let mut events = self.signaling.subscribe(&Topic::Group(group_id.clone()));
        let core = self.this.clone();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(envelope) => {
                        let Some(core) = core.upgrade() else {
                            return;
                        };
                        core.apply(Input::Signal(envelope.event)).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("group {group_id} watcher lagged by {n} events");
                        let Some(core) = core.upgrade() else {
                            return;
                        };
                        core.resync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        debug!("{} now watching group topic {}", self.user(), slot.key());
        slot.insert(handle.abort_handle());
    }

    fn was_finished(&self, call_id: &CallId) -> bool {
        self.finished.lock().unwrap().contains(call_id)
    }

    fn remember_finished(&self, call_id: CallId) {
        let mut finished = self.finished.lock().unwrap();
        if finished.len() == FINISHED_MEMORY {
            finished.pop_front();
        }
        finished.push_back(call_id);
    }

    fn forget_finished(&self, call_id: &CallId) {
        self.finished.lock().unwrap().retain(|id| id != call_id);
    }
}
