//! End-to-end session behavior against in-memory channels.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use network_session::{
    testing::{MemoryChannel, RecordingEngine, ScriptedProtocol},
    Session, SessionConfig, SessionError, SessionRole, SessionState,
};
use network_shared::{
    Envelope, EnvelopeMeta, IdentityUpdate, Player, RedirectTarget, TunnelMode,
};

fn server_session(
    engine: &Arc<RecordingEngine>,
    channel: &Arc<MemoryChannel>,
    protocol: &Arc<ScriptedProtocol>,
) -> Arc<Session> {
    Session::server(
        engine.clone(),
        channel.shared(),
        protocol.clone(),
        None,
        SessionConfig::default(),
    )
}

#[test]
fn pre_game_sends_buffer_until_first_game_pulse() {
    let engine = RecordingEngine::new();
    let channel = MemoryChannel::new("client:1");
    let protocol = ScriptedProtocol::new("handshake");
    let session = server_session(&engine, &channel, &protocol);

    session.send(false, false, Envelope::new(0, 1, "a"));
    session.send(false, false, Envelope::new(0, 2, "b"));
    // handshake traffic bypasses the buffer
    session.send(false, true, Envelope::new(0, 99, "hs"));
    session.send(false, false, Envelope::new(0, 3, "c"));

    assert_eq!(channel.written_kinds(), vec![99]);

    session.set_state(SessionState::Game);
    session.pulse();

    assert_eq!(channel.written_kinds(), vec![99, 1, 2, 3]);
}

#[test]
fn handler_sends_land_after_the_flushed_backlog() {
    let engine = RecordingEngine::new();
    let channel = MemoryChannel::new("client:1");
    let protocol = ScriptedProtocol::new("game");
    protocol.register_fn(50, |_, session, _, _| {
        session.send(false, false, Envelope::new(0, 4, "reply"));
        Ok(())
    });
    let session = server_session(&engine, &channel, &protocol);

    session.send(false, false, Envelope::new(0, 1, "a"));
    session.send(false, false, Envelope::new(0, 2, "b"));
    session.message_received(false, Envelope::new(0, 50, "ping"));

    session.set_state(SessionState::Game);
    session.pulse();

    assert_eq!(channel.written_kinds(), vec![1, 2, 4]);
}

#[test]
fn wrong_direction_sends_are_dropped() {
    let engine = RecordingEngine::new();
    let protocol = ScriptedProtocol::new("game");

    let server_channel = MemoryChannel::new("client:1");
    let server = server_session(&engine, &server_channel, &protocol);
    server.set_state(SessionState::Game);
    server.send(true, false, Envelope::new(0, 1, ""));
    assert!(server_channel.writes().is_empty());

    let client_channel = MemoryChannel::new("server:1");
    let client = Session::client(
        engine.clone(),
        client_channel.shared(),
        protocol.clone(),
        None,
        SessionConfig::default(),
    );
    client.set_state(SessionState::Game);
    client.send(false, false, Envelope::new(0, 1, ""));
    assert!(client_channel.writes().is_empty());
    client.send(true, false, Envelope::new(0, 2, ""));
    assert_eq!(client_channel.written_kinds(), vec![2]);
}

#[test]
fn send_all_preserves_submission_order() {
    let engine = RecordingEngine::new();
    let channel = MemoryChannel::new("client:1");
    let protocol = ScriptedProtocol::new("game");
    let session = server_session(&engine, &channel, &protocol);
    session.set_state(SessionState::Game);

    session.send_all(
        false,
        false,
        (1..=5).map(|kind| Envelope::new(0, kind, "")),
    );
    assert_eq!(channel.written_kinds(), vec![1, 2, 3, 4, 5]);
}

#[test]
fn protocol_upgrades_exactly_once() {
    let engine = RecordingEngine::new();
    let channel = MemoryChannel::new("client:1");
    let bootstrap = ScriptedProtocol::new("bootstrap");
    let session = server_session(&engine, &channel, &bootstrap);

    let game = ScriptedProtocol::new("game");
    session.set_protocol(game.clone()).unwrap();
    assert_eq!(session.protocol().name(), "game");

    // re-setting the same instance is tolerated
    session.set_protocol(game.clone()).unwrap();

    let other = ScriptedProtocol::new("other");
    assert!(matches!(
        session.set_protocol(other),
        Err(SessionError::ProtocolAlreadySet)
    ));
}

#[test]
fn player_binds_once_per_connection_cycle() {
    let engine = RecordingEngine::new();
    let channel = MemoryChannel::new("client:1");
    let protocol = ScriptedProtocol::new("game");
    let session = server_session(&engine, &channel, &protocol);

    session.bind_player(Arc::new(Player::new("elaria"))).unwrap();
    assert!(matches!(
        session.bind_player(Arc::new(Player::new("borin"))),
        Err(SessionError::PlayerAlreadyBound)
    ));

    session.dispose();
    assert!(matches!(
        session.bind_player(Arc::new(Player::new("borin"))),
        Err(SessionError::Disposed)
    ));
}

#[test]
fn dispose_fires_leave_broadcast_save_exactly_once() {
    let engine = RecordingEngine::new();
    let channel = MemoryChannel::new("client:1");
    let protocol = ScriptedProtocol::new("game");
    let session = server_session(&engine, &channel, &protocol);
    session.bind_player(Arc::new(Player::new("elaria"))).unwrap();

    session.dispose();
    session.dispose();

    assert_eq!(engine.leaves(), vec!["elaria"]);
    assert_eq!(engine.saves(), vec!["elaria"]);
    assert_eq!(engine.broadcasts(), vec!["elaria has left the game"]);
    assert!(session.player().is_none());
}

#[test]
fn kick_writes_farewell_then_closes() {
    let engine = RecordingEngine::new();
    let channel = MemoryChannel::new("client:1");
    let protocol = ScriptedProtocol::with_kick("game", 200);
    let session = server_session(&engine, &channel, &protocol);
    session.bind_player(Arc::new(Player::new("elaria"))).unwrap();
    session.set_state(SessionState::Game);

    assert!(session.disconnect(true, "cheating"));

    assert_eq!(engine.kicks(), vec![("elaria".into(), "cheating".into())]);
    // kick event overrides the leave broadcast; no separate leave event fires
    assert!(engine.leaves().is_empty());
    assert_eq!(engine.broadcasts(), vec!["elaria has been kicked"]);
    assert_eq!(engine.saves(), vec!["elaria"]);

    let writes = channel.writes();
    assert_eq!(writes.last().map(|e| e.kind), Some(200));
    assert_eq!(channel.close_count(), 1);
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn cancelled_kick_keeps_the_session_alive() {
    let engine = RecordingEngine::new();
    engine.cancel_kicks(true);
    let channel = MemoryChannel::new("client:1");
    let protocol = ScriptedProtocol::with_kick("game", 200);
    let session = server_session(&engine, &channel, &protocol);
    session.bind_player(Arc::new(Player::new("elaria"))).unwrap();
    session.set_state(SessionState::Game);

    assert!(!session.disconnect(true, "cheating"));

    assert_eq!(channel.close_count(), 0);
    assert_eq!(session.state(), SessionState::Game);
    assert!(session.has_player());
    assert!(engine.leaves().is_empty());
    assert!(engine.saves().is_empty());
}

#[test]
fn handler_failure_disconnects_with_descriptive_reason() {
    let engine = RecordingEngine::new();
    let channel = MemoryChannel::new("client:1");
    let protocol = ScriptedProtocol::with_kick("game", 200);
    protocol.register_fn(7, |_, _, _, _| Err(anyhow::anyhow!("boom")));
    let other_handled = Arc::new(AtomicUsize::new(0));
    let counter = other_handled.clone();
    protocol.register_fn(8, move |_, _, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let session = server_session(&engine, &channel, &protocol);
    session.set_state(SessionState::Game);

    session.message_received(false, Envelope::new(0, 7, ""));
    session.message_received(false, Envelope::new(0, 8, ""));
    session.pulse();

    // one bad handler does not abort the tick
    assert_eq!(other_handled.load(Ordering::SeqCst), 1);
    assert_eq!(session.state(), SessionState::Closed);
    let farewell = channel.writes().into_iter().last().unwrap();
    assert_eq!(farewell.kind, 200);
    assert_eq!(
        std::str::from_utf8(&farewell.payload).unwrap(),
        "Message handler exception for kind 7"
    );
}

#[test]
fn transport_failure_disconnects_with_socket_error() {
    let engine = RecordingEngine::new();
    let channel = MemoryChannel::new("client:1");
    let protocol = ScriptedProtocol::new("game");
    let session = server_session(&engine, &channel, &protocol);
    session.set_state(SessionState::Game);

    channel.fail_writes(true);
    session.send(false, false, Envelope::new(0, 1, ""));

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(channel.close_count(), 1);
}

#[test]
fn spikes_delay_but_never_drop_inbound_messages() {
    let engine = RecordingEngine::new();
    let channel = MemoryChannel::new("client:1");
    let protocol = ScriptedProtocol::new("game");
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    protocol.register_fn(1, move |_, _, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let session = Session::server(
        engine.clone(),
        channel.shared(),
        protocol.clone(),
        None,
        SessionConfig {
            recv_spike_chance: 1.0,
            recv_spike_latency: Duration::from_millis(5),
            ..SessionConfig::default()
        },
    );
    session.set_state(SessionState::Game);

    for _ in 0..5 {
        session.message_received(false, Envelope::new(0, 1, ""));
    }
    for _ in 0..200 {
        session.pulse();
        if handled.load(Ordering::SeqCst) == 5 {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(handled.load(Ordering::SeqCst), 5);
}

// ---- proxy ---------------------------------------------------------------

fn proxy_session(
    engine: &Arc<RecordingEngine>,
    channel: &Arc<MemoryChannel>,
    protocol: &Arc<ScriptedProtocol>,
) -> Arc<Session> {
    Session::proxy(
        engine.clone(),
        channel.shared(),
        protocol.clone(),
        None,
        SessionConfig::default(),
    )
}

#[test]
fn aux_channel_only_exists_on_proxies() {
    let engine = RecordingEngine::new();
    let channel = MemoryChannel::new("client:1");
    let protocol = ScriptedProtocol::new("game");
    let session = server_session(&engine, &channel, &protocol);
    assert_eq!(session.role(), SessionRole::Server);

    let backend = MemoryChannel::new("backend:1");
    assert!(matches!(
        session.bind_aux_channel(backend.shared()),
        Err(SessionError::NotAProxy)
    ));
}

#[test]
fn primary_channel_identity() {
    let engine = RecordingEngine::new();
    let channel = MemoryChannel::new("client:1");
    let protocol = ScriptedProtocol::new("game");
    let session = proxy_session(&engine, &channel, &protocol);

    let backend = MemoryChannel::new("backend:1");
    session.bind_aux_channel(backend.shared()).unwrap();

    assert!(session.is_primary(&channel.shared()));
    assert!(!session.is_primary(&backend.shared()));
}

#[test]
fn passthrough_tunnels_both_directions_without_queueing() {
    let engine = RecordingEngine::new();
    let client = MemoryChannel::new("client:1");
    let backend = MemoryChannel::new("backend:1");
    let protocol = ScriptedProtocol::new("proxy");
    let session = proxy_session(&engine, &client, &protocol);
    session.bind_aux_channel(backend.shared()).unwrap();

    session.message_received(
        true,
        Envelope::new(0, 10, "").with_meta(EnvelopeMeta::ProxyStart),
    );
    assert!(session.passthrough());
    // the start marker itself is forwarded downstream
    assert_eq!(client.written_kinds(), vec![10]);

    session.message_received(true, Envelope::new(0, 11, "chunk"));
    session.message_received(false, Envelope::new(0, 12, "move"));

    assert_eq!(client.written_kinds(), vec![10, 11]);
    assert_eq!(backend.written_kinds(), vec![12]);

    // tunneled traffic never reaches the dispatch queues
    session.pulse();
    assert_eq!(client.written_kinds(), vec![10, 11]);
    assert_eq!(backend.written_kinds(), vec![12]);
}

#[test]
fn transformable_messages_are_stamped_with_the_connect_epoch() {
    let engine = RecordingEngine::new();
    let client = MemoryChannel::new("client:1");
    let backend = MemoryChannel::new("backend:1");
    let protocol = ScriptedProtocol::new("proxy");
    let session = proxy_session(&engine, &client, &protocol);
    session.bind_aux_channel(backend.shared()).unwrap();
    assert_eq!(session.connect_count(), 1);

    session.message_received(
        true,
        Envelope::new(0, 10, "").with_meta(EnvelopeMeta::ProxyStart),
    );
    session.message_received(true, Envelope::new(0, 11, "").transformable());

    let forwarded = client.writes().into_iter().last().unwrap();
    assert_eq!(forwarded.epoch, Some(1));
    assert_eq!(forwarded.tunnel, TunnelMode::Transform);
}

#[test]
fn redirect_with_known_identity_reconnects() {
    let engine = RecordingEngine::new();
    let client = MemoryChannel::new("client:1");
    let backend = MemoryChannel::new("backend:1");
    let protocol = ScriptedProtocol::new("proxy");
    let session = proxy_session(&engine, &client, &protocol);
    session.bind_aux_channel(backend.shared()).unwrap();

    // client identifies itself before the tunnel opens
    session.message_received(
        false,
        Envelope::new(0, 1, "").with_meta(EnvelopeMeta::Identity(IdentityUpdate::identifier(
            "elaria",
        ))),
    );
    session.message_received(
        true,
        Envelope::new(0, 10, "").with_meta(EnvelopeMeta::ProxyStart),
    );
    assert!(session.passthrough());

    session.message_received(
        true,
        Envelope::new(0, 20, "").with_meta(EnvelopeMeta::Redirect(RedirectTarget {
            active: true,
            hostname: "shard-2.example".into(),
            port: 25565,
        })),
    );

    assert_eq!(backend.close_count(), 1);
    assert!(!session.passthrough());
    assert!(session.aux_connection_info().is_none());
    assert_eq!(
        engine.backend_requests(),
        vec![network_session::testing::BackendRequest {
            hostname: "shard-2.example".into(),
            port: 25565,
            identifier: "elaria".into(),
        }]
    );

    // a fresh backend can now be bound, bumping the epoch
    let next = MemoryChannel::new("backend:2");
    session.bind_aux_channel(next.shared()).unwrap();
    assert_eq!(session.connect_count(), 2);
}

#[test]
fn redirect_without_identity_closes_backend_and_stays_put() {
    let engine = RecordingEngine::new();
    let client = MemoryChannel::new("client:1");
    let backend = MemoryChannel::new("backend:1");
    let protocol = ScriptedProtocol::new("proxy");
    let session = proxy_session(&engine, &client, &protocol);
    session.bind_aux_channel(backend.shared()).unwrap();
    session.message_received(
        true,
        Envelope::new(0, 10, "").with_meta(EnvelopeMeta::ProxyStart),
    );

    session.message_received(
        true,
        Envelope::new(0, 20, "").with_meta(EnvelopeMeta::Redirect(RedirectTarget {
            active: true,
            hostname: "shard-2.example".into(),
            port: 25565,
        })),
    );

    assert_eq!(backend.close_count(), 1);
    assert!(engine.backend_requests().is_empty());
    // without an identity to carry over, the redirect is passed on to the
    // client to deal with
    assert!(session.passthrough());
    assert_eq!(client.written_kinds(), vec![10, 20]);
}

#[test]
fn inactive_redirect_is_plain_traffic() {
    let engine = RecordingEngine::new();
    let client = MemoryChannel::new("client:1");
    let backend = MemoryChannel::new("backend:1");
    let protocol = ScriptedProtocol::new("proxy");
    let session = proxy_session(&engine, &client, &protocol);
    session.bind_aux_channel(backend.shared()).unwrap();
    session.message_received(
        true,
        Envelope::new(0, 10, "").with_meta(EnvelopeMeta::ProxyStart),
    );

    session.message_received(
        true,
        Envelope::new(0, 20, "").with_meta(EnvelopeMeta::Redirect(RedirectTarget {
            active: false,
            hostname: "ignored".into(),
            port: 0,
        })),
    );

    assert_eq!(backend.close_count(), 0);
    assert!(engine.backend_requests().is_empty());
    assert_eq!(client.written_kinds(), vec![10, 20]);
}

#[test]
fn outbound_identity_traffic_feeds_the_channel_info() {
    let engine = RecordingEngine::new();
    let client = MemoryChannel::new("client:1");
    let backend = MemoryChannel::new("backend:1");
    let protocol = ScriptedProtocol::new("proxy");
    let session = proxy_session(&engine, &client, &protocol);
    session.bind_aux_channel(backend.shared()).unwrap();
    session.set_state(SessionState::Game);

    // identity the proxy relays to the backend lands in the aux record
    session.send(
        true,
        false,
        Envelope::new(0, 1, "").with_meta(EnvelopeMeta::Identity(IdentityUpdate::identifier(
            "elaria",
        ))),
    );
    // identity it announces to the client lands in the primary record
    session.send(
        false,
        false,
        Envelope::new(0, 2, "").with_meta(EnvelopeMeta::Identity(
            IdentityUpdate::default().with_entity_id(5),
        )),
    );

    assert_eq!(session.aux_connection_info().unwrap().identifier, "elaria");
    assert_eq!(
        session.primary_connection_info().unwrap().entity_id,
        Some(5)
    );
    assert_eq!(backend.written_kinds(), vec![1]);
    assert_eq!(client.written_kinds(), vec![2]);
}

#[test]
fn upstream_sends_without_backend_are_dropped() {
    let engine = RecordingEngine::new();
    let client = MemoryChannel::new("client:1");
    let protocol = ScriptedProtocol::new("proxy");
    let session = proxy_session(&engine, &client, &protocol);
    session.set_state(SessionState::Game);

    session.send(true, false, Envelope::new(0, 1, ""));
    assert!(client.writes().is_empty());
    assert_eq!(session.state(), SessionState::Game);
}

#[test]
fn backend_write_failure_disconnects_with_socket_error() {
    let engine = RecordingEngine::new();
    let client = MemoryChannel::new("client:1");
    let backend = MemoryChannel::new("backend:1");
    let protocol = ScriptedProtocol::new("proxy");
    let session = proxy_session(&engine, &client, &protocol);
    session.bind_aux_channel(backend.shared()).unwrap();
    session.set_state(SessionState::Game);

    backend.fail_writes(true);
    session.send(true, false, Envelope::new(0, 1, ""));

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(client.close_count(), 1);
    // teardown also closes the bound backend channel
    assert_eq!(backend.close_count(), 1);
}
