use callcore::types::CallId;
use dashmap::DashMap;
use log::debug;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Trailing debounce keyed by call id.
///
/// Every trigger restarts the window for its key; only the last trigger in a
/// burst runs its action. Superseded timers are not aborted, they find their
/// token replaced when they wake up and do nothing.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: Arc<DashMap<CallId, u64>>,
    next_token: AtomicU64,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Arc::new(DashMap::new()),
            next_token: AtomicU64::new(0),
        }
    }

    /// Returns true when this trigger started a new window, false when it
    /// folded into one already pending.
    pub fn trigger<F, Fut>(&self, key: CallId, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        let fresh = self.pending.insert(key.clone(), token).is_none();
        if !fresh {
            debug!("notification for {key} coalesced");
        }
        let pending = self.pending.clone();
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if pending.remove_if(&key, |_, current| *current == token).is_some() {
                action().await;
            }
        });
        fresh
    }

    /// Drops the pending trigger for `key`, if any.
    pub fn cancel(&self, key: &CallId) -> bool {
        self.pending.remove(key).is_some()
    }

    pub fn is_pending(&self, key: &CallId) -> bool {
        self.pending.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn hit(count: &Arc<AtomicU32>) -> impl FnOnce() -> std::future::Ready<()> + Send + 'static {
        let count = count.clone();
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_into_one() {
        let debouncer = Debouncer::new(Duration::from_millis(300));
        let count = Arc::new(AtomicU32::new(0));
        let key = CallId::new("c1");

        assert!(debouncer.trigger(key.clone(), hit(&count)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!debouncer.trigger(key.clone(), hit(&count)));
        assert!(!debouncer.trigger(key.clone(), hit(&count)));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_trigger_never_fires() {
        let debouncer = Debouncer::new(Duration::from_millis(300));
        let count = Arc::new(AtomicU32::new(0));
        debouncer.trigger(CallId::new("c1"), hit(&count));
        assert!(debouncer.cancel(&CallId::new("c1")));
        assert!(!debouncer.cancel(&CallId::new("c1")));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let debouncer = Debouncer::new(Duration::from_millis(300));
        let count = Arc::new(AtomicU32::new(0));
        assert!(debouncer.trigger(CallId::new("c1"), hit(&count)));
        assert!(debouncer.trigger(CallId::new("c2"), hit(&count)));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
