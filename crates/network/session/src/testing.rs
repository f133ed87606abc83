//! In-memory doubles for exercising sessions without sockets.
//!
//! Used by this crate's own tests and by downstream crates that want to
//! drive a [`Session`](crate::session::Session) against scripted traffic.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use network_shared::{Channel, Envelope, MessageKind, Player, SharedChannel, TransportError};

use crate::{
    engine::{EngineHooks, KickDecision},
    lock,
    protocol::{MessageHandler, Protocol},
    session::Session,
};

/// Channel that records every write instead of touching a socket.
pub struct MemoryChannel {
    label: String,
    open: AtomicBool,
    fail_writes: AtomicBool,
    closes: AtomicUsize,
    writes: Mutex<Vec<Envelope>>,
}

impl MemoryChannel {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            open: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
        })
    }

    /// The same channel as a trait object, for handing to a session.
    pub fn shared(self: &Arc<Self>) -> SharedChannel {
        Arc::clone(self) as SharedChannel
    }

    pub fn writes(&self) -> Vec<Envelope> {
        lock(&self.writes).clone()
    }

    pub fn written_kinds(&self) -> Vec<MessageKind> {
        self.writes().iter().map(|e| e.kind).collect()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Release);
    }

    /// Makes every subsequent write fail with a transport error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }
}

impl Channel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn write(&self, envelope: Envelope) -> Result<(), TransportError> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(TransportError::Other("scripted write failure".into()));
        }
        lock(&self.writes).push(envelope);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.closes.fetch_add(1, Ordering::AcqRel);
    }

    fn peer_label(&self) -> String {
        self.label.clone()
    }
}

struct FnHandler<F>(F);

impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(bool, &Arc<Session>, Option<&Player>, &Envelope) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(
        &self,
        upstream: bool,
        session: &Arc<Session>,
        player: Option<&Player>,
        envelope: &Envelope,
    ) -> anyhow::Result<()> {
        (self.0)(upstream, session, player, envelope)
    }
}

/// Wraps a closure as a [`MessageHandler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(bool, &Arc<Session>, Option<&Player>, &Envelope) -> anyhow::Result<()>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnHandler(f))
}

/// Protocol whose handler table is assembled by the test.
pub struct ScriptedProtocol {
    name: String,
    kick_kind: Option<MessageKind>,
    handlers: Mutex<HashMap<MessageKind, Arc<dyn MessageHandler>>>,
}

impl ScriptedProtocol {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kick_kind: None,
            handlers: Mutex::new(HashMap::new()),
        })
    }

    /// Like [`new`](Self::new), but disconnects produce a farewell message
    /// of the given kind.
    pub fn with_kick(name: impl Into<String>, kick_kind: MessageKind) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kick_kind: Some(kick_kind),
            handlers: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(&self, kind: MessageKind, handler: Arc<dyn MessageHandler>) {
        lock(&self.handlers).insert(kind, handler);
    }

    pub fn register_fn<F>(&self, kind: MessageKind, f: F)
    where
        F: Fn(bool, &Arc<Session>, Option<&Player>, &Envelope) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.register(kind, handler_fn(f));
    }
}

impl Protocol for ScriptedProtocol {
    fn name(&self) -> &str {
        &self.name
    }

    fn handler(&self, kind: MessageKind) -> Option<Arc<dyn MessageHandler>> {
        lock(&self.handlers).get(&kind).cloned()
    }

    fn kick_message(&self, reason: &str) -> Option<Envelope> {
        self.kick_kind
            .map(|kind| Envelope::new(0, kind, reason.to_owned().into_bytes()))
    }
}

/// Backend connection requested through
/// [`EngineHooks::connect_backend`](crate::engine::EngineHooks::connect_backend).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRequest {
    pub hostname: String,
    pub port: u16,
    pub identifier: String,
}

/// Engine that records every hook invocation.
pub struct RecordingEngine {
    cancel_kicks: AtomicBool,
    kicks: Mutex<Vec<(String, String)>>,
    leaves: Mutex<Vec<String>>,
    saves: Mutex<Vec<String>>,
    broadcasts: Mutex<Vec<String>>,
    backend_requests: Mutex<Vec<BackendRequest>>,
}

impl RecordingEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cancel_kicks: AtomicBool::new(false),
            kicks: Mutex::new(Vec::new()),
            leaves: Mutex::new(Vec::new()),
            saves: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
            backend_requests: Mutex::new(Vec::new()),
        })
    }

    pub fn cancel_kicks(&self, cancel: bool) {
        self.cancel_kicks.store(cancel, Ordering::Release);
    }

    pub fn kicks(&self) -> Vec<(String, String)> {
        lock(&self.kicks).clone()
    }

    pub fn leaves(&self) -> Vec<String> {
        lock(&self.leaves).clone()
    }

    pub fn saves(&self) -> Vec<String> {
        lock(&self.saves).clone()
    }

    pub fn broadcasts(&self) -> Vec<String> {
        lock(&self.broadcasts).clone()
    }

    pub fn backend_requests(&self) -> Vec<BackendRequest> {
        lock(&self.backend_requests).clone()
    }
}

impl EngineHooks for RecordingEngine {
    fn on_player_kick(&self, player: &Player, reason: &str) -> KickDecision {
        lock(&self.kicks).push((player.name.clone(), reason.to_owned()));
        if self.cancel_kicks.load(Ordering::Acquire) {
            KickDecision::Cancel
        } else {
            KickDecision::Allow {
                leave_message: Some(format!("{} has been kicked", player.name)),
            }
        }
    }

    fn on_player_leave(&self, player: &Player) -> Option<String> {
        lock(&self.leaves).push(player.name.clone());
        Some(format!("{} has left the game", player.name))
    }

    fn on_player_save(&self, player: &Player) {
        lock(&self.saves).push(player.name.clone());
    }

    fn broadcast(&self, text: &str) {
        lock(&self.broadcasts).push(text.to_owned());
    }

    fn remove_from_world(&self, _player: &Player) -> anyhow::Result<()> {
        Ok(())
    }

    fn connect_backend(
        &self,
        hostname: &str,
        port: u16,
        identifier: &str,
        _session: &Arc<Session>,
    ) {
        lock(&self.backend_requests).push(BackendRequest {
            hostname: hostname.to_owned(),
            port,
            identifier: identifier.to_owned(),
        });
    }
}
