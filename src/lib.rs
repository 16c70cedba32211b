//! Voice/video call signaling and media session orchestration.
//!
//! The pure call model lives in `callcore`; this crate adds the tokio side:
//! the server-authoritative [`registry::CallRegistry`], the client
//! [`controller`]s with their [`media::MediaSessionManager`]s, and the
//! in-memory bus, notification and directory collaborators they run against.

pub mod bus;
pub mod config;
pub mod controller;
pub mod directory;
pub mod media;
pub mod notify;
pub mod registry;
pub mod retry;
pub mod session;
pub mod signaling;

pub use callcore;
pub use config::CallConfig;
pub use session::ClientSession;
