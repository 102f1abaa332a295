use std::thread;
use std::time::{Duration, Instant};

use tether::{
    AuthorityHost, MAX_PAYLOAD_SIZE, NetError, NetEvent, Packet, PeerHost, PeerId, Reliability,
    Runtime,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const EXCHANGE_LIMIT: Duration = Duration::from_secs(3);

/// Runs the peer-side blocking connect on a helper thread while driving the
/// authority's service loop, returning the established peer host plus every
/// authority event produced along the way.
fn connect_driving(authority: &mut AuthorityHost, port: u16) -> (PeerHost, Vec<NetEvent>) {
    let (result, events) = connect_attempt(authority, port);
    (result.expect("connect failed"), events)
}

fn connect_attempt(
    authority: &mut AuthorityHost,
    port: u16,
) -> (Result<PeerHost, NetError>, Vec<NetEvent>) {
    let handle = thread::spawn(move || PeerHost::connect("127.0.0.1", port, CONNECT_TIMEOUT));
    let mut events = Vec::new();
    while !handle.is_finished() {
        events.extend(authority.service(Duration::from_millis(5)));
    }
    (handle.join().expect("connect thread panicked"), events)
}

fn wait_events(authority: &mut AuthorityHost, want: usize, limit: Duration) -> Vec<NetEvent> {
    let deadline = Instant::now() + limit;
    let mut events = Vec::new();
    while events.len() < want && Instant::now() < deadline {
        events.extend(authority.service(Duration::from_millis(5)));
    }
    events
}

fn wait_peer_events(peer: &mut PeerHost, want: usize, limit: Duration) -> Vec<NetEvent> {
    let deadline = Instant::now() + limit;
    let mut events = Vec::new();
    while events.len() < want && Instant::now() < deadline {
        events.extend(peer.service(Duration::from_millis(5)));
    }
    events
}

fn connect_ids(events: &[NetEvent]) -> Vec<PeerId> {
    events
        .iter()
        .filter_map(|event| match event {
            NetEvent::Connect { peer } => Some(*peer),
            _ => None,
        })
        .collect()
}

fn receives(events: Vec<NetEvent>) -> Vec<(PeerId, Packet)> {
    events
        .into_iter()
        .filter_map(|event| match event {
            NetEvent::Receive { peer, packet } => Some((peer, packet)),
            _ => None,
        })
        .collect()
}

#[test]
fn identities_assigned_in_connection_order_until_capacity() {
    let _rt = Runtime::init();
    let mut authority = AuthorityHost::bind(0, 2).unwrap();
    let port = authority.local_addr().port();

    let (_peer_a, events) = connect_driving(&mut authority, port);
    assert_eq!(connect_ids(&events), vec![1]);

    let (_peer_b, events) = connect_driving(&mut authority, port);
    assert_eq!(connect_ids(&events), vec![2]);
    assert_eq!(authority.connected_count(), 2);

    // a third attempt is refused during the handshake
    let (result, events) = connect_attempt(&mut authority, port);
    match result {
        Err(NetError::ConnectFailure { reason }) => assert!(reason.contains("full")),
        other => panic!("expected refusal, got {:?}", other),
    }
    assert!(connect_ids(&events).is_empty());
    assert_eq!(authority.connected_count(), 2);
}

#[test]
fn position_update_is_received_and_rebroadcast() {
    let _rt = Runtime::init();
    let mut authority = AuthorityHost::bind(0, 8).unwrap();
    let port = authority.local_addr().port();

    let (mut peer_a, _) = connect_driving(&mut authority, port);
    let (mut peer_b, _) = connect_driving(&mut authority, port);

    let mut update = Packet::new();
    update.append(10.0f32);
    update.append(20.0f32);
    peer_a.send(&update, Reliability::Reliable, 0).unwrap();

    let received = receives(wait_events(&mut authority, 1, EXCHANGE_LIMIT));
    assert_eq!(received.len(), 1);
    let (sender, mut packet) = received.into_iter().next().unwrap();
    assert_eq!(sender, 1);
    assert_eq!(packet.as_bytes(), update.as_bytes());
    assert_eq!(packet.read::<f32>().unwrap(), 10.0);
    assert_eq!(packet.read::<f32>().unwrap(), 20.0);

    let mut relay = Packet::new();
    relay.append(sender);
    relay.append(10.0f32);
    relay.append(20.0f32);
    authority.broadcast(&relay, Reliability::Reliable, 0).unwrap();

    // every connected peer sees exactly one copy, bytes preserved
    for peer in [&mut peer_a, &mut peer_b] {
        let received = receives(wait_peer_events(peer, 1, EXCHANGE_LIMIT));
        assert_eq!(received.len(), 1);
        let (from, mut packet) = received.into_iter().next().unwrap();
        assert_eq!(from, 0);
        assert_eq!(packet.as_bytes(), relay.as_bytes());
        assert_eq!(packet.read::<u32>().unwrap(), 1);
        assert_eq!(packet.read::<f32>().unwrap(), 10.0);
        assert_eq!(packet.read::<f32>().unwrap(), 20.0);
    }
}

#[test]
fn one_service_call_drains_a_burst_in_order() {
    let _rt = Runtime::init();
    let mut authority = AuthorityHost::bind(0, 4).unwrap();
    let port = authority.local_addr().port();

    let (mut peer, _) = connect_driving(&mut authority, port);
    for value in 0..3u32 {
        let mut packet = Packet::new();
        packet.append(value);
        peer.send(&packet, Reliability::Reliable, 0).unwrap();
    }

    thread::sleep(Duration::from_millis(100));
    let received = receives(authority.service(Duration::ZERO));
    assert_eq!(received.len(), 3);
    for (value, (sender, mut packet)) in received.into_iter().enumerate() {
        assert_eq!(sender, 1);
        assert_eq!(packet.read::<u32>().unwrap(), value as u32);
    }
}

#[test]
fn zero_timeout_poll_does_not_block() {
    let _rt = Runtime::init();
    let mut authority = AuthorityHost::bind(0, 4).unwrap();

    let started = Instant::now();
    let events = authority.service(Duration::ZERO);
    assert!(events.is_empty());
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[test]
fn authority_disconnect_retires_the_identity() {
    let _rt = Runtime::init();
    let mut authority = AuthorityHost::bind(0, 4).unwrap();
    let port = authority.local_addr().port();

    let (mut peer, _) = connect_driving(&mut authority, port);

    authority.disconnect(1).unwrap();
    let events = wait_events(&mut authority, 1, EXCHANGE_LIMIT);
    assert!(matches!(events.as_slice(), [NetEvent::Disconnect { peer: 1 }]));
    assert_eq!(authority.connected_count(), 0);

    let mut packet = Packet::new();
    packet.append(1u8);
    assert!(matches!(
        authority.send_to(1, &packet, Reliability::Reliable, 0),
        Err(NetError::UnknownPeer { peer: 1 })
    ));

    // the remote end observes the same teardown
    let events = wait_peer_events(&mut peer, 1, EXCHANGE_LIMIT);
    assert!(matches!(events.as_slice(), [NetEvent::Disconnect { peer: 0 }]));
    assert!(matches!(
        peer.send(&packet, Reliability::Reliable, 0),
        Err(NetError::UnknownPeer { peer: 0 })
    ));
}

#[test]
fn peer_disconnect_reaches_the_authority() {
    let _rt = Runtime::init();
    let mut authority = AuthorityHost::bind(0, 4).unwrap();
    let port = authority.local_addr().port();

    let (mut peer, _) = connect_driving(&mut authority, port);
    assert!(peer.is_connected());

    peer.disconnect();
    let events = wait_peer_events(&mut peer, 1, EXCHANGE_LIMIT);
    assert!(matches!(events.as_slice(), [NetEvent::Disconnect { peer: 0 }]));
    assert!(!peer.is_connected());

    let events = wait_events(&mut authority, 1, EXCHANGE_LIMIT);
    assert!(matches!(events.as_slice(), [NetEvent::Disconnect { peer: 1 }]));
    assert_eq!(authority.connected_count(), 0);
}

#[test]
fn connect_to_a_silent_port_times_out() {
    let _rt = Runtime::init();
    let free_port = {
        let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let started = Instant::now();
    let result = PeerHost::connect("127.0.0.1", free_port, Duration::from_millis(300));
    assert!(matches!(result, Err(NetError::ConnectTimeout)));
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[test]
fn binding_an_occupied_port_fails() {
    let _rt = Runtime::init();
    let first = AuthorityHost::bind(0, 4).unwrap();
    let port = first.local_addr().port();

    assert!(matches!(
        AuthorityHost::bind(port, 4),
        Err(NetError::Bind(_))
    ));
}

#[test]
fn send_validation_precedes_peer_resolution() {
    let _rt = Runtime::init();
    let mut authority = AuthorityHost::bind(0, 4).unwrap();

    let mut oversized = Packet::new();
    oversized.append_bytes(&vec![0u8; MAX_PAYLOAD_SIZE + 1]);
    assert!(matches!(
        authority.send_to(9, &oversized, Reliability::Reliable, 0),
        Err(NetError::PayloadTooLarge { .. })
    ));

    let mut small = Packet::new();
    small.append(1u8);
    assert!(matches!(
        authority.send_to(9, &small, Reliability::Reliable, 7),
        Err(NetError::InvalidChannel { channel: 7 })
    ));
    assert!(matches!(
        authority.send_to(9, &small, Reliability::Unreliable, 0),
        Err(NetError::UnknownPeer { peer: 9 })
    ));
}
