//! Session/transport multiplexing layer for Emberveil.
//!
//! A [`Session`](session::Session) is the per-connection state machine that
//! arbitrates handshake-vs-game message flow. Sessions come in three roles
//! (client, server, proxy); the proxy role adds a backend channel,
//! passthrough tunneling and redirect-driven reconnection. Outbound
//! delivery ordering is owned by the [`SendPool`](send_pool::SendPool):
//! strictly serial per channel bucket, parallel across buckets.
//!
//! Wire codecs, the handler registry internals, world state and the raw
//! socket transport are external collaborators behind the traits in
//! `network_shared` and [`protocol`]/[`engine`].

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod engine;
pub mod protocol;
mod proxy;
pub mod send_pool;
pub mod session;
pub mod testing;

pub use engine::{EngineHooks, KickDecision};
pub use protocol::{MessageHandler, Protocol};
pub use send_pool::{SendPool, BUCKET_COUNT};
pub use session::{
    DisconnectOnFailure, HandlerFailureHook, Session, SessionConfig, SessionError, SessionRole,
    SessionState,
};

/// Lock that survives a poisoned mutex; teardown paths must keep working
/// even if another thread panicked mid-operation.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
