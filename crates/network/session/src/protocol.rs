//! Protocol and handler traits the session dispatches through.

use std::sync::Arc;

use network_shared::{Envelope, MessageKind, Player};

use crate::session::Session;

/// Per-connection protocol implementation.
///
/// Every session starts with a bootstrap protocol; the handshake upgrades it
/// exactly once via [`Session::set_protocol`](crate::session::Session::set_protocol).
pub trait Protocol: Send + Sync {
    fn name(&self) -> &str;

    /// Handler lookup by message kind. `None` means the kind carries no
    /// behavior at this stage and is ignored by `pulse`.
    fn handler(&self, kind: MessageKind) -> Option<Arc<dyn MessageHandler>>;

    /// Final "you are being disconnected" message, if the protocol has one.
    /// Without one the channel is closed without a farewell.
    fn kick_message(&self, reason: &str) -> Option<Envelope>;
}

/// Application hook invoked by `pulse` for each inbound message.
///
/// Handlers run on the tick thread. A returned error does not abort the
/// tick; the session's failure hook decides what happens (by default the
/// session is disconnected).
pub trait MessageHandler: Send + Sync {
    fn handle(
        &self,
        upstream: bool,
        session: &Arc<Session>,
        player: Option<&Player>,
        envelope: &Envelope,
    ) -> anyhow::Result<()>;
}
