//! The message envelope contract consumed by the session layer.
//!
//! Application messages are opaque to this layer. The envelope carries the
//! two routing keys the layer needs (`channel_id` for outbound ordering,
//! `kind` for handler dispatch) plus the proxy capabilities as a closed set
//! of typed fields instead of run-time type tests.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionInfo, IdentityUpdate};

/// Partition key for outbound delivery ordering.
pub type ChannelId = u32;

/// Dispatch key used for handler lookup.
pub type MessageKind = u16;

/// Backend a redirecting proxy should connect to next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectTarget {
    /// A redirect message with `active == false` is a plain announcement and
    /// triggers no reconnection.
    pub active: bool,
    pub hostname: String,
    pub port: u16,
}

/// Session-layer metadata a message may carry.
///
/// The set is closed on purpose: the session layer can match exhaustively
/// and a new capability is a compile error everywhere it matters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeMeta {
    /// Ordinary game traffic with no session-layer semantics.
    Plain,
    /// Carries identity fields merged into the channel's [`ConnectionInfo`].
    Identity(IdentityUpdate),
    /// Backend signal that passthrough tunneling starts now.
    ProxyStart,
    /// Backend instruction to swap to a different backend.
    Redirect(RedirectTarget),
}

/// Whether a tunneling proxy may rewrite this message in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelMode {
    /// Forward byte-for-byte.
    Opaque,
    /// Apply [`Envelope::transform`] before forwarding.
    Transform,
}

/// One message as seen by the session layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub channel_id: ChannelId,
    pub kind: MessageKind,
    pub payload: Bytes,
    pub meta: EnvelopeMeta,
    pub tunnel: TunnelMode,
    /// Connect epoch stamped by [`Envelope::transform`]; `None` until a
    /// tunneling proxy has rewritten the message.
    pub epoch: Option<u32>,
}

impl Envelope {
    pub fn new(channel_id: ChannelId, kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            channel_id,
            kind,
            payload: payload.into(),
            meta: EnvelopeMeta::Plain,
            tunnel: TunnelMode::Opaque,
            epoch: None,
        }
    }

    pub fn with_meta(mut self, meta: EnvelopeMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Marks the envelope as rewritable by a tunneling proxy.
    pub fn transformable(mut self) -> Self {
        self.tunnel = TunnelMode::Transform;
        self
    }

    /// Rewrites the envelope for passthrough forwarding.
    ///
    /// `upstream` is the direction the message is about to travel (towards
    /// the backend when true). The connect epoch is stamped so ids minted by
    /// successive backends stay distinguishable, and entity ids that belong
    /// to the side the message came from are remapped to the ids the
    /// receiving side knows.
    pub fn transform(
        mut self,
        upstream: bool,
        connects: u32,
        primary: Option<&ConnectionInfo>,
        aux: Option<&ConnectionInfo>,
    ) -> Envelope {
        self.epoch = Some(connects);
        if let EnvelopeMeta::Identity(update) = &mut self.meta {
            let (from, to) = if upstream { (primary, aux) } else { (aux, primary) };
            if let (Some(from), Some(to)) = (from, to) {
                if update.entity_id.is_some() && update.entity_id == from.entity_id {
                    update.entity_id = to.entity_id;
                }
            }
        }
        self
    }
}
