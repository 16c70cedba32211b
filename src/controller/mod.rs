//! Client-side call controllers.
//!
//! Each controller mirrors the registry's view of the one call its user is
//! in, owns the ring countdown and the debounced incoming notification, and
//! drives its [`MediaSessionManager`](crate::media::MediaSessionManager).

mod countdown;
mod debounce;
mod group;
mod personal;
mod runner;

pub use countdown::Countdown;
pub use debounce::Debouncer;
pub use group::GroupCallController;
pub use personal::PersonalCallController;

use callcore::CallError;
use callcore::fsm::{ActiveCall, CallUpdate};
use callcore::types::CallId;

/// Receives what a controller wants the user interface to show.
pub trait CallObserver: Send + Sync {
    /// Debounced: duplicate deliveries of one ring produce a single call.
    fn on_incoming_call(&self, _call: &ActiveCall) {}

    fn on_call_updated(&self, _update: &CallUpdate) {}

    /// The media join ran out of retries. The call itself stays up.
    fn on_media_failed(&self, _call_id: &CallId, _error: &CallError) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl CallObserver for NoopObserver {}
