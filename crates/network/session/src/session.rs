//! The per-connection state machine.
//!
//! One `Session` exists per accepted transport connection. Inbound messages
//! are queued by `message_received` (called from I/O completion) and drained
//! by `pulse`, which the engine's main loop calls once per tick — never
//! concurrently with itself for one session. Outbound messages either go
//! through the [`SendPool`](crate::send_pool::SendPool) (steady state) or
//! into the pre-game buffer (before identification completes).

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use rand::Rng;
use tracing::{debug, error, info, trace, warn};

use network_shared::{
    ConnectionInfo, Envelope, EnvelopeMeta, MessageKind, Player, SessionId, SharedChannel,
    TunnelMode,
};

use crate::{
    engine::{EngineHooks, KickDecision},
    lock,
    protocol::Protocol,
    proxy::ProxyState,
    send_pool::SendPool,
};

/// Connection lifecycle states. Transitions are driven by the handshake
/// protocol code; the session itself only reacts to the state for outbound
/// buffering decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the peer's initial handshake message.
    Handshake,
    /// Identification/encryption exchange in progress.
    Negotiating,
    /// Steady state; the session may own a player.
    Game,
    /// Terminal, reached via disconnect.
    Closed,
}

/// Which side of the connection this session represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Client,
    Server,
    Proxy,
}

/// State violations. These are programmer errors in the calling engine code
/// and are never swallowed by the session layer.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("the protocol may only be set once per session")]
    ProtocolAlreadySet,
    #[error("a player is already bound to this session")]
    PlayerAlreadyBound,
    #[error("session already disposed")]
    Disposed,
    #[error("aux channel may not be rebound without closing the previous one")]
    AuxChannelBound,
    #[error("no aux channel is bound")]
    AuxChannelMissing,
    #[error("aux channels only exist for proxy sessions")]
    NotAProxy,
}

/// Tunables for a single session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Log channel disconnects at debug level.
    pub log_connections: bool,
    /// Per-tick probability of simulating an inbound latency spike.
    /// Soak-testing aid; zero disables it.
    pub recv_spike_chance: f32,
    /// Upper bound of a simulated spike; the actual stall is a random
    /// fraction of this.
    pub recv_spike_latency: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            log_connections: false,
            recv_spike_chance: 0.0,
            recv_spike_latency: Duration::from_millis(500),
        }
    }
}

/// Reaction to a message handler returning an error during `pulse`.
pub trait HandlerFailureHook: Send + Sync {
    fn on_handler_failure(&self, session: &Arc<Session>, kind: MessageKind, error: &anyhow::Error);
}

/// Default failure hook: log with message kind and player identity, then
/// disconnect with a descriptive reason.
pub struct DisconnectOnFailure;

impl HandlerFailureHook for DisconnectOnFailure {
    fn on_handler_failure(&self, session: &Arc<Session>, kind: MessageKind, error: &anyhow::Error) {
        let player = session
            .player()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "none".into());
        error!(session = %session.id(), kind, player, %error, "message handler failed");
        session.disconnect(false, &format!("Message handler exception for kind {kind}"));
    }
}

enum PlayerSlot {
    Empty,
    Bound(Arc<Player>),
    Disposed,
}

/// Whether the leave event has already been fired for the player being
/// released (a kick event counts as the leave event).
enum LeaveEvent {
    NotFired,
    Fired(Option<String>),
}

/// A single connection, which may or may not own a player.
pub struct Session {
    id: SessionId,
    role: SessionRole,
    engine: Arc<dyn EngineHooks>,
    channel: SharedChannel,
    send_pool: Option<Arc<SendPool>>,
    config: SessionConfig,
    state: Mutex<SessionState>,
    /// Protocol the session was created with; used until negotiation
    /// selects the real one.
    bootstrap_protocol: Arc<dyn Protocol>,
    selected_protocol: Mutex<Option<Arc<dyn Protocol>>>,
    player: Mutex<PlayerSlot>,
    /// Inbound queues, drained only by `pulse`. Guarded so that I/O
    /// completion threads can append safely; the original relied on an
    /// undocumented single-producer guarantee instead.
    inbound_downstream: Mutex<VecDeque<Envelope>>,
    inbound_upstream: Mutex<VecDeque<Envelope>>,
    /// Outbound messages issued before the session reached `Game`.
    pre_game: Mutex<VecDeque<Envelope>>,
    failure_hook: Mutex<Arc<dyn HandlerFailureHook>>,
    spike_until: Mutex<Option<Instant>>,
    proxy: Option<ProxyState>,
}

impl Session {
    pub fn client(
        engine: Arc<dyn EngineHooks>,
        channel: SharedChannel,
        bootstrap_protocol: Arc<dyn Protocol>,
        send_pool: Option<Arc<SendPool>>,
        config: SessionConfig,
    ) -> Arc<Self> {
        Self::with_role(SessionRole::Client, engine, channel, bootstrap_protocol, send_pool, config)
    }

    pub fn server(
        engine: Arc<dyn EngineHooks>,
        channel: SharedChannel,
        bootstrap_protocol: Arc<dyn Protocol>,
        send_pool: Option<Arc<SendPool>>,
        config: SessionConfig,
    ) -> Arc<Self> {
        Self::with_role(SessionRole::Server, engine, channel, bootstrap_protocol, send_pool, config)
    }

    pub fn proxy(
        engine: Arc<dyn EngineHooks>,
        channel: SharedChannel,
        bootstrap_protocol: Arc<dyn Protocol>,
        send_pool: Option<Arc<SendPool>>,
        config: SessionConfig,
    ) -> Arc<Self> {
        Self::with_role(SessionRole::Proxy, engine, channel, bootstrap_protocol, send_pool, config)
    }

    fn with_role(
        role: SessionRole,
        engine: Arc<dyn EngineHooks>,
        channel: SharedChannel,
        bootstrap_protocol: Arc<dyn Protocol>,
        send_pool: Option<Arc<SendPool>>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let proxy = matches!(role, SessionRole::Proxy).then(ProxyState::new);
        Arc::new(Self {
            id: SessionId::new(),
            role,
            engine,
            channel,
            send_pool,
            config,
            state: Mutex::new(SessionState::Handshake),
            bootstrap_protocol,
            selected_protocol: Mutex::new(None),
            player: Mutex::new(PlayerSlot::Empty),
            inbound_downstream: Mutex::new(VecDeque::new()),
            inbound_upstream: Mutex::new(VecDeque::new()),
            pre_game: Mutex::new(VecDeque::new()),
            failure_hook: Mutex::new(Arc::new(DisconnectOnFailure)),
            spike_until: Mutex::new(None),
            proxy,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn set_state(&self, state: SessionState) {
        let previous = {
            let mut guard = lock(&self.state);
            std::mem::replace(&mut *guard, state)
        };
        if previous != state {
            trace!(session = %self.id, ?previous, ?state, "session state changed");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_open()
    }

    /// True only for the channel the session was created with; a proxy's
    /// aux channel is never primary.
    pub fn is_primary(&self, channel: &SharedChannel) -> bool {
        Arc::ptr_eq(&self.channel, channel)
    }

    /// The protocol currently in effect for this session.
    pub fn protocol(&self) -> Arc<dyn Protocol> {
        lock(&self.selected_protocol)
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.bootstrap_protocol))
    }

    /// Upgrades from the bootstrap protocol. May succeed at most once;
    /// re-setting the same instance is a no-op.
    pub fn set_protocol(&self, protocol: Arc<dyn Protocol>) -> Result<(), SessionError> {
        let mut slot = lock(&self.selected_protocol);
        match &*slot {
            Some(existing) if Arc::ptr_eq(existing, &protocol) => Ok(()),
            Some(_) => Err(SessionError::ProtocolAlreadySet),
            None => {
                debug!(session = %self.id, protocol = protocol.name(), "protocol selected");
                *slot = Some(protocol);
                Ok(())
            }
        }
    }

    pub fn has_player(&self) -> bool {
        self.player().is_some()
    }

    pub fn player(&self) -> Option<Arc<Player>> {
        match &*lock(&self.player) {
            PlayerSlot::Bound(player) => Some(Arc::clone(player)),
            _ => None,
        }
    }

    /// Associates a player with this session, once per connection cycle.
    pub fn bind_player(&self, player: Arc<Player>) -> Result<(), SessionError> {
        let mut slot = lock(&self.player);
        match &*slot {
            PlayerSlot::Empty => {
                *slot = PlayerSlot::Bound(player);
                Ok(())
            }
            PlayerSlot::Bound(_) => Err(SessionError::PlayerAlreadyBound),
            PlayerSlot::Disposed => Err(SessionError::Disposed),
        }
    }

    pub fn set_failure_hook(&self, hook: Arc<dyn HandlerFailureHook>) {
        *lock(&self.failure_hook) = hook;
    }

    // ---- outbound ---------------------------------------------------------

    /// Sends a message in the given direction, relative to this session's
    /// role. Wrong-direction sends are logged and dropped. `force` bypasses
    /// pre-game buffering (used by handshake code).
    pub fn send(self: &Arc<Self>, upstream: bool, force: bool, envelope: Envelope) {
        match self.role {
            SessionRole::Server if upstream => {
                warn!(session = %self.id, kind = envelope.kind, "server session dropped upstream send");
                return;
            }
            SessionRole::Client if !upstream => {
                warn!(session = %self.id, kind = envelope.kind, "client session dropped downstream send");
                return;
            }
            SessionRole::Proxy if upstream => {
                self.send_aux(envelope);
                return;
            }
            _ => {}
        }

        if let (Some(proxy), EnvelopeMeta::Identity(update)) = (&self.proxy, &envelope.meta) {
            proxy.update_info(false, update);
        }

        if force || self.state() == SessionState::Game {
            self.write_now(envelope);
        } else {
            lock(&self.pre_game).push_back(envelope);
        }
    }

    pub fn send_all(
        self: &Arc<Self>,
        upstream: bool,
        force: bool,
        envelopes: impl IntoIterator<Item = Envelope>,
    ) {
        for envelope in envelopes {
            self.send(upstream, force, envelope);
        }
    }

    /// Proxy upstream path: straight to the backend channel, no buffering.
    fn send_aux(self: &Arc<Self>, envelope: Envelope) {
        let Some(proxy) = &self.proxy else {
            // role check guarantees this; keep the message out of the wire anyway
            warn!(session = %self.id, "dropped upstream send on non-proxy session");
            return;
        };
        if let EnvelopeMeta::Identity(update) = &envelope.meta {
            proxy.update_info(true, update);
        }
        match proxy.aux_channel() {
            Some(aux) => {
                if let Err(error) = aux.write(envelope) {
                    error!(session = %self.id, %error, "backend write failed");
                    self.disconnect(false, "Socket Error!");
                }
            }
            None => {
                warn!(session = %self.id, "dropped upstream send with no backend channel bound");
            }
        }
    }

    /// Immediate write to the primary channel, through the send pool when
    /// one is attached.
    fn write_now(self: &Arc<Self>, envelope: Envelope) {
        if !self.channel.is_open() {
            return;
        }
        match &self.send_pool {
            Some(pool) => pool.send(self, &self.channel, envelope),
            None => {
                if let Err(error) = self.channel.write(envelope) {
                    error!(session = %self.id, %error, "channel write failed");
                    self.disconnect(false, "Socket Error!");
                }
            }
        }
    }

    // ---- inbound ----------------------------------------------------------

    /// Accepts one decoded message from I/O completion. `upstream` is true
    /// when the message came from a server (for a proxy: from the backend on
    /// the aux channel). Must not be called concurrently with `pulse` for
    /// the same session from the same direction's decoder; the queues
    /// themselves are guarded.
    pub fn message_received(self: &Arc<Self>, upstream: bool, envelope: Envelope) {
        let envelope = match &self.proxy {
            Some(_) => match self.proxy_receive(upstream, envelope) {
                Some(envelope) => envelope,
                None => return,
            },
            None => envelope,
        };
        let queue = if upstream {
            &self.inbound_upstream
        } else {
            &self.inbound_downstream
        };
        lock(queue).push_back(envelope);
    }

    /// Proxy-specific receive handling. Returns the envelope when it should
    /// still be queued for normal dispatch, `None` when consumed here.
    fn proxy_receive(self: &Arc<Self>, upstream: bool, envelope: Envelope) -> Option<Envelope> {
        let proxy = self.proxy.as_ref()?;

        if let EnvelopeMeta::Identity(update) = &envelope.meta {
            proxy.update_info(upstream, update);
        }

        if upstream {
            match &envelope.meta {
                EnvelopeMeta::ProxyStart => {
                    proxy.start_passthrough();
                    debug!(session = %self.id, "passthrough enabled");
                }
                EnvelopeMeta::Redirect(target) if target.active => {
                    // the backend may already have dropped the link; closing is
                    // tolerant here
                    let _ = proxy.close_aux(false, self.kick_message("Redirect received"));
                    proxy.clear_aux_info();
                    if let Some(info) = proxy.primary_info() {
                        proxy.stop_passthrough();
                        info!(
                            session = %self.id,
                            host = %target.hostname,
                            port = target.port,
                            identifier = %info.identifier,
                            "redirecting to new backend"
                        );
                        self.engine.connect_backend(
                            &target.hostname,
                            target.port,
                            &info.identifier,
                            self,
                        );
                        return None;
                    }
                    // without primary info there is no client identity to carry
                    // forward; the redirect is inert
                }
                _ => {}
            }
        }

        if proxy.passthrough() {
            let forward_upstream = !upstream;
            let mut envelope = envelope;
            if envelope.tunnel == TunnelMode::Transform {
                let primary = proxy.primary_info();
                let aux = proxy.aux_info();
                envelope = envelope.transform(
                    forward_upstream,
                    proxy.connects(),
                    primary.as_ref(),
                    aux.as_ref(),
                );
            }
            self.send(forward_upstream, true, envelope);
            return None;
        }

        Some(envelope)
    }

    /// Per-tick drain: flush the pre-game backlog once in `Game`, then
    /// dispatch queued inbound messages (downstream first). Never called
    /// concurrently with itself for one session.
    pub fn pulse(self: &Arc<Self>) {
        if self.state() == SessionState::Game {
            let backlog: Vec<Envelope> = lock(&self.pre_game).drain(..).collect();
            for envelope in backlog {
                self.write_now(envelope);
            }
        }

        if self.config.recv_spike_chance > 0.0 && self.spiking() {
            return;
        }

        loop {
            let next = lock(&self.inbound_downstream).pop_front();
            match next {
                Some(envelope) => self.dispatch(false, envelope),
                None => break,
            }
        }
        loop {
            let next = lock(&self.inbound_upstream).pop_front();
            match next {
                Some(envelope) => self.dispatch(true, envelope),
                None => break,
            }
        }
    }

    /// Simulated receive-latency spikes. The tick that rolls a spike still
    /// drains; subsequent ticks stall until the deadline passes.
    fn spiking(&self) -> bool {
        let now = Instant::now();
        let mut until = lock(&self.spike_until);
        if let Some(deadline) = *until {
            if now < deadline {
                return true;
            }
            *until = None;
        }
        let mut rng = rand::thread_rng();
        if rng.gen::<f32>() < self.config.recv_spike_chance {
            let spike = self.config.recv_spike_latency.mul_f32(rng.gen::<f32>());
            *until = Some(now + spike);
        }
        false
    }

    fn dispatch(self: &Arc<Self>, upstream: bool, envelope: Envelope) {
        let protocol = self.protocol();
        let Some(handler) = protocol.handler(envelope.kind) else {
            trace!(session = %self.id, kind = envelope.kind, "no handler for message kind");
            return;
        };
        let player = self.player();
        let kind = envelope.kind;
        if let Err(error) = handler.handle(upstream, self, player.as_deref(), &envelope) {
            let hook = lock(&self.failure_hook).clone();
            hook.on_handler_failure(self, kind, &error);
        }
    }

    // ---- teardown ---------------------------------------------------------

    fn kick_message(&self, reason: &str) -> Option<Envelope> {
        self.protocol().kick_message(reason)
    }

    /// Disconnects the session. With `kick` the engine's kick event may
    /// cancel the disconnect, in which case this returns false and the
    /// session stays connected.
    pub fn disconnect(self: &Arc<Self>, kick: bool, reason: &str) -> bool {
        let mut leave = LeaveEvent::NotFired;
        if let Some(player) = self.player() {
            if kick {
                match self.engine.on_player_kick(&player, reason) {
                    KickDecision::Cancel => {
                        debug!(session = %self.id, player = %player.name, "kick cancelled");
                        return false;
                    }
                    KickDecision::Allow { leave_message } => {
                        info!(session = %self.id, player = %player.name, reason, "player kicked");
                        leave = LeaveEvent::Fired(leave_message);
                    }
                }
            }
        }

        self.dispose_with(leave);

        match self.kick_message(reason) {
            Some(envelope) => self.channel.write_then_close(envelope),
            None => self.channel.close(),
        }

        if let Some(proxy) = &self.proxy {
            let _ = proxy.close_aux(false, self.kick_message(reason));
        }

        self.set_state(SessionState::Closed);
        true
    }

    /// Releases the bound player: leave event (if not already fired), leave
    /// broadcast, save event, best-effort world teardown. A second call is
    /// a no-op.
    pub fn dispose(self: &Arc<Self>) {
        self.dispose_with(LeaveEvent::NotFired);
    }

    fn dispose_with(&self, leave: LeaveEvent) {
        let previous = {
            let mut slot = lock(&self.player);
            std::mem::replace(&mut *slot, PlayerSlot::Disposed)
        };
        match previous {
            PlayerSlot::Disposed => return,
            PlayerSlot::Empty => {}
            PlayerSlot::Bound(player) => {
                let text = match leave {
                    LeaveEvent::Fired(message) => message,
                    LeaveEvent::NotFired => self.engine.on_player_leave(&player),
                };
                if let Some(text) = text.filter(|t| !t.is_empty()) {
                    self.engine.broadcast(&text);
                }
                self.engine.on_player_save(&player);
                if let Err(error) = self.engine.remove_from_world(&player) {
                    warn!(session = %self.id, player = %player.name, %error, "player teardown failed");
                }
            }
        }
        if self.config.log_connections {
            debug!(session = %self.id, peer = %self.channel.peer_label(), "channel disconnected");
        }
    }

    // ---- proxy surface ----------------------------------------------------

    /// Binds the backend channel of a proxy session. Fails if one is still
    /// bound, or on non-proxy sessions.
    pub fn bind_aux_channel(&self, channel: SharedChannel) -> Result<(), SessionError> {
        let proxy = self.proxy.as_ref().ok_or(SessionError::NotAProxy)?;
        let connects = proxy.bind_aux(channel)?;
        debug!(session = %self.id, connects, "backend channel bound");
        Ok(())
    }

    /// Closes the bound backend channel; fails if nothing is bound.
    pub fn close_aux_channel(&self) -> Result<(), SessionError> {
        let proxy = self.proxy.as_ref().ok_or(SessionError::NotAProxy)?;
        proxy.close_aux(true, self.kick_message("Closing aux channel"))
    }

    pub fn passthrough(&self) -> bool {
        self.proxy.as_ref().is_some_and(ProxyState::passthrough)
    }

    /// Number of successful backend binds (proxy sessions only).
    pub fn connect_count(&self) -> u32 {
        self.proxy.as_ref().map_or(0, ProxyState::connects)
    }

    pub fn primary_connection_info(&self) -> Option<ConnectionInfo> {
        self.proxy.as_ref().and_then(ProxyState::primary_info)
    }

    pub fn aux_connection_info(&self) -> Option<ConnectionInfo> {
        self.proxy.as_ref().and_then(ProxyState::aux_info)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state())
            .field("peer", &self.channel.peer_label())
            .finish()
    }
}
