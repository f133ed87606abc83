//! Engine-side callbacks consumed by the session layer.

use std::sync::Arc;

use network_shared::Player;

use crate::session::Session;

/// Decision returned by the kick event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KickDecision {
    /// Proceed with the disconnect; optionally override the broadcast text.
    Allow { leave_message: Option<String> },
    /// Keep the session connected.
    Cancel,
}

/// The slice of the engine the session layer is allowed to touch.
///
/// Event ordering per player: at most one kick *or* leave, then save, then
/// world teardown. [`Session::dispose`](crate::session::Session::dispose)
/// enforces the at-most-once part.
pub trait EngineHooks: Send + Sync {
    /// Cancellable kick event. Only fired when the disconnect is a kick.
    fn on_player_kick(&self, player: &Player, reason: &str) -> KickDecision;

    /// Leave event; returns the chat line to broadcast, if any.
    fn on_player_leave(&self, player: &Player) -> Option<String>;

    /// Persistence point fired while the player is being released.
    fn on_player_save(&self, player: &Player);

    /// Chat line visible to the whole server.
    fn broadcast(&self, text: &str);

    /// Best-effort removal of the player's in-world presence. Errors are
    /// logged by the caller, never rethrown.
    fn remove_from_world(&self, player: &Player) -> anyhow::Result<()>;

    /// Proxy redirect support: open a new backend connection and bind it to
    /// `session` via `bind_aux_channel` once established.
    fn connect_backend(&self, hostname: &str, port: u16, identifier: &str, session: &Arc<Session>);
}
