//! Shared networking contracts for Emberveil.
//!
//! This crate hosts the leaf types the session layer is built against:
//! - envelope: the closed message envelope contract (channel id, dispatch
//!   kind, capability metadata)
//! - connection: identity/metadata merged from both traffic directions
//! - transport: the minimal channel trait the raw transport must expose
//! - player: the player record a session may own
//! - session_id: compact per-connection identifier
//!
//! Keep this crate lean; the session state machine itself lives in
//! `network_session`.

pub mod connection;
pub mod envelope;
pub mod player;
pub mod session_id;
pub mod transport;

pub use connection::{ConnectionInfo, IdentityUpdate};
pub use envelope::{ChannelId, Envelope, EnvelopeMeta, MessageKind, RedirectTarget, TunnelMode};
pub use player::Player;
pub use session_id::SessionId;
pub use transport::{Channel, SharedChannel, TransportError};
