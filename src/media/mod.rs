//! Media room membership for calls.

mod manager;
pub mod transport;

pub use manager::{JoinOutcome, MediaSessionManager};
pub use transport::{
    ConnectionState, LoopbackFactory, LoopbackNetwork, LoopbackScript, LoopbackTransport,
    MediaKind, MediaTransport, TransportEvent, TransportFactory,
};
