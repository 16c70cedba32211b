//! Runtime-agnostic core of the call orchestrator.
//!
//! Nothing in here performs I/O or depends on an async runtime: the data
//! model, the registry's compare-and-set transitions, the signaling event
//! vocabulary and the pure client state machine all live here so both the
//! server-side registry and the client controllers share one definition.

pub mod api;
pub mod error;
pub mod events;
pub mod fsm;
pub mod notification;
pub mod retry;
pub mod session;
pub mod types;

pub use error::{CallError, InvalidTransition, TransportError, TransportErrorClass};
