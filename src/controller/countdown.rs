use callcore::types::CallId;
use log::debug;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;

struct Armed {
    token: u64,
    call_id: CallId,
    handle: AbortHandle,
}

/// The ring countdown of one controller. At most one is armed at a time.
///
/// A countdown that fires disarms itself before running its callback, so the
/// callback may call [`Countdown::cancel`] without aborting itself.
#[derive(Default)]
pub struct Countdown {
    slot: Arc<Mutex<Option<Armed>>>,
    next_token: AtomicU64,
}

impl std::fmt::Debug for Countdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Countdown")
            .field("armed_for", &self.armed_for())
            .finish()
    }
}

impl Countdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a countdown for `call_id`, replacing any armed one.
    pub fn start<F, Fut>(&self, call_id: CallId, delay: Duration, on_expire: F)
    where
        F: FnOnce(CallId) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        let mut slot = self.slot.lock().unwrap();
        if let Some(previous) = slot.take() {
            previous.handle.abort();
        }
        let task_slot = self.slot.clone();
        let expired = call_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let fired = {
                let mut slot = task_slot.lock().unwrap();
                if slot.as_ref().is_some_and(|armed| armed.token == token) {
                    slot.take()
                } else {
                    None
                }
            };
            if fired.is_some() {
                debug!("countdown for {expired} expired");
                on_expire(expired).await;
            }
        });
        *slot = Some(Armed {
            token,
            call_id,
            handle: handle.abort_handle(),
        });
    }

    /// Disarms the countdown. Returns false when nothing was armed.
    pub fn cancel(&self) -> bool {
        match self.slot.lock().unwrap().take() {
            Some(armed) => {
                armed.handle.abort();
                debug!("countdown for {} cancelled", armed.call_id);
                true
            }
            None => false,
        }
    }

    pub fn armed_for(&self) -> Option<CallId> {
        self.slot
            .lock()
            .unwrap()
            .as_ref()
            .map(|armed| armed.call_id.clone())
    }
}
