use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use partyline::net::{
    DatagramSink, Envelope, Inbound, Inbox, MessageKind, decode_ack_payload,
    decode_roster_payload,
};
use partyline::{DisconnectReason, Role, SendError, Session, SessionEvent, TransportConfig};

/// In-memory datagram sink that records everything the session transmits.
#[derive(Clone, Default)]
struct Wire {
    datagrams: Arc<Mutex<Vec<(SocketAddr, Vec<u8>)>>>,
}

impl DatagramSink for Wire {
    fn send_datagram(&self, bytes: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.datagrams.lock().unwrap().push((addr, bytes.to_vec()));
        Ok(bytes.len())
    }
}

impl Wire {
    fn take(&self) -> Vec<(SocketAddr, Envelope)> {
        std::mem::take(&mut *self.datagrams.lock().unwrap())
            .into_iter()
            .map(|(addr, bytes)| (addr, Envelope::decode(&bytes).unwrap()))
            .collect()
    }
}

struct Node {
    session: Session,
    wire: Wire,
    inbox: Inbox,
    addr: SocketAddr,
}

impl Node {
    fn host(config: TransportConfig, now: Instant) -> Self {
        let wire = Wire::default();
        let inbox = Inbox::new();
        let session = Session::new(
            Role::Host,
            config,
            "host",
            Box::new(wire.clone()),
            inbox.clone(),
            now,
        );
        Self {
            session,
            wire,
            inbox,
            addr: HOST,
        }
    }

    fn client(addr: SocketAddr, name: &str, config: TransportConfig, now: Instant) -> Self {
        let wire = Wire::default();
        let inbox = Inbox::new();
        let session = Session::new(
            Role::Client { host: HOST },
            config,
            name,
            Box::new(wire.clone()),
            inbox.clone(),
            now,
        );
        Self {
            session,
            wire,
            inbox,
            addr,
        }
    }

    fn events(&mut self) -> Vec<SessionEvent> {
        self.session.drain_events().collect()
    }
}

const HOST: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 5000);

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn at(t0: Instant, millis: u64) -> Instant {
    t0 + Duration::from_millis(millis)
}

fn chat(id: u64, text: &str) -> Envelope {
    Envelope::new(id, MessageKind::from_tag("CHAT"), text)
}

fn deliver(inbox: &Inbox, from: SocketAddr, envelope: Envelope) {
    inbox.push(Inbound {
        from,
        envelope,
        size: 64,
    });
}

/// Moves every datagram `from` sent to `to` into `to`'s inbound queue.
fn shuttle(from: &Node, to: &Node) -> usize {
    let mut moved = 0;
    for (dest, envelope) in from.wire.take() {
        if dest == to.addr {
            deliver(&to.inbox, from.addr, envelope);
            moved += 1;
        }
    }
    moved
}

fn handshake(host: &mut Node, client: &mut Node, now: Instant) {
    shuttle(client, host);
    host.session.tick_at(now);
    shuttle(host, client);
    client.session.tick_at(now);
    shuttle(client, host);
    host.session.tick_at(now);
    host.wire.take();
}

fn join(host: &mut Node, from: SocketAddr, name: &str, now: Instant) {
    deliver(&host.inbox, from, Envelope::new(0, MessageKind::Join, name));
    host.session.tick_at(now);
}

fn acked_ids(sent: &[(SocketAddr, Envelope)], to: SocketAddr) -> Vec<u64> {
    sent.iter()
        .filter(|(dest, e)| *dest == to && e.kind == MessageKind::Ack)
        .flat_map(|(_, e)| decode_ack_payload(&e.payload).unwrap())
        .collect()
}

#[test]
fn test_duplicate_envelope_dispatched_once() {
    let t0 = Instant::now();
    let mut host = Node::host(TransportConfig::default(), t0);
    let alice = addr(6001);
    join(&mut host, alice, "alice", t0);

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    host.session.register_handler("CHAT", move |delivery| {
        assert_eq!(delivery.sender, "alice");
        assert_eq!(delivery.payload(), "hello");
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let message = chat(1, "hello");
    deliver(&host.inbox, alice, message.clone());
    deliver(&host.inbox, alice, message.clone());
    host.session.tick_at(at(t0, 10));
    deliver(&host.inbox, alice, message);
    host.session.tick_at(at(t0, 20));

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(host.session.stats().duplicates_dropped, 2);

    // Every copy is still acknowledged so the sender can retire it.
    let acked = acked_ids(&host.wire.take(), alice);
    assert!(acked.contains(&0));
    assert_eq!(acked.iter().filter(|&&id| id == 1).count(), 3);
}

#[test]
fn test_lossless_send_acknowledged_within_one_batch() {
    let t0 = Instant::now();
    let config = TransportConfig::default();
    let mut host = Node::host(config.clone(), t0);
    let mut client = Node::client(addr(6001), "alice", config, t0);

    handshake(&mut host, &mut client, t0);

    assert!(client.session.peer(&HOST).unwrap().pending.is_empty());
    assert!(host.session.peer(&client.addr).unwrap().pending.is_empty());
    assert_eq!(client.session.roster(), ["host", "alice"]);
    assert_eq!(host.session.roster(), ["host", "alice"]);

    let id = client.session.send_to_host("CHAT", "gg").unwrap();
    assert!(client.session.peer(&HOST).unwrap().pending.contains(id));

    shuttle(&client, &host);
    host.session.tick_at(at(t0, 20));

    let events = host.events();
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Message { sender, envelope, .. }
            if sender == "alice" && envelope.payload == "gg"
    )));

    shuttle(&host, &client);
    client.session.tick_at(at(t0, 30));
    assert!(client.session.peer(&HOST).unwrap().pending.is_empty());
    assert_eq!(client.session.stats().retransmissions, 0);
}

#[test]
fn test_unanswered_message_retried_then_lost() {
    let t0 = Instant::now();
    let config = TransportConfig {
        max_missed_heartbeats: 50,
        ..Default::default()
    };
    let mut client = Node::client(addr(6001), "alice", config, t0);

    let id = client.session.send_to_host("CHAT", "anyone?").unwrap();
    let copies_of = |sent: Vec<(SocketAddr, Envelope)>| {
        sent.iter().filter(|(_, e)| e.id == id).count()
    };

    let mut copies = copies_of(client.wire.take());
    assert_eq!(copies, 1);

    for step in 1..=30u64 {
        client.session.tick_at(at(t0, step * 100));
        let sent = copies_of(client.wire.take());
        if step > 20 {
            assert_eq!(sent, 0, "retransmitted after being dropped");
        }
        copies += sent;
    }

    // One original plus max_retries retransmissions.
    assert_eq!(copies, 4);
    let peer = client.session.peer(&HOST).unwrap();
    assert!(!peer.pending.contains(id));
    assert!(peer.pending.is_empty());

    let lost: Vec<u64> = client
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::DeliveryLost { to, envelope } if to == HOST => Some(envelope.id),
            _ => None,
        })
        .collect();
    assert_eq!(lost, vec![0, id]);

    let stats = client.session.stats();
    assert_eq!(stats.retransmissions, 6);
    assert_eq!(stats.deliveries_lost, 2);
    assert!(!client.session.is_closed());
}

#[test]
fn test_lost_datagram_recovered_and_dispatched_once() {
    let t0 = Instant::now();
    let config = TransportConfig::default();
    let mut host = Node::host(config.clone(), t0);
    let mut client = Node::client(addr(6001), "alice", config, t0);
    handshake(&mut host, &mut client, t0);

    let received = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&received);
    host.session.register_handler("CHAT", move |delivery| {
        log.lock().unwrap().push(delivery.payload().to_string());
    });

    let first = client.session.send_to_host("CHAT", "a").unwrap();
    let second = client.session.send_to_host("CHAT", "b").unwrap();
    let third = client.session.send_to_host("CHAT", "c").unwrap();
    assert!(first < second && second < third);

    // The datagram carrying the second id is held back in transit.
    let mut delayed = None;
    for (_, envelope) in client.wire.take() {
        if envelope.id == second {
            delayed = Some(envelope);
        } else {
            deliver(&host.inbox, client.addr, envelope);
        }
    }
    let delayed = delayed.unwrap();

    host.session.tick_at(at(t0, 10));
    shuttle(&host, &client);
    client.session.tick_at(at(t0, 20));

    let pending: Vec<u64> = client
        .session
        .peer(&HOST)
        .unwrap()
        .pending
        .iter()
        .map(|p| p.envelope.id)
        .collect();
    assert_eq!(pending, vec![second]);

    client.session.tick_at(at(t0, 500));
    let resent: Vec<Envelope> = client
        .wire
        .take()
        .into_iter()
        .filter(|(_, e)| e.id == second)
        .map(|(_, e)| e)
        .collect();
    assert_eq!(resent.len(), 1);
    for envelope in resent {
        deliver(&host.inbox, client.addr, envelope);
    }
    host.session.tick_at(at(t0, 510));

    deliver(&host.inbox, client.addr, delayed);
    host.session.tick_at(at(t0, 520));

    assert_eq!(*received.lock().unwrap(), vec!["a", "c", "b"]);
    assert_eq!(host.session.stats().duplicates_dropped, 1);

    shuttle(&host, &client);
    client.session.tick_at(at(t0, 530));
    assert!(client.session.peer(&HOST).unwrap().pending.is_empty());
}

#[test]
fn test_silent_peer_removed_at_third_missed_heartbeat() {
    let t0 = Instant::now();
    let mut host = Node::host(TransportConfig::default(), t0);
    let alice = addr(6001);
    let bob = addr(6002);

    deliver(&host.inbox, alice, Envelope::new(0, MessageKind::Join, "alice"));
    deliver(&host.inbox, bob, Envelope::new(0, MessageKind::Join, "bob"));
    host.session.tick_at(t0);
    host.events();
    host.wire.take();

    let mut last_sent = Vec::new();
    for step in 1..=15u64 {
        // Alice keeps talking, bob has gone quiet since his JOIN.
        deliver(&host.inbox, alice, Envelope::new(100 + step, MessageKind::Pong, "alice"));
        host.session.tick_at(at(t0, step * 100));
        last_sent = host.wire.take();

        if step < 15 {
            assert!(
                host.session.peer(&bob).is_some(),
                "bob removed early at {}ms",
                step * 100
            );
        }
    }

    assert!(host.session.peer(&bob).is_none());
    assert!(host.session.peer(&alice).is_some());

    let events = host.events();
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::PeerLeft { addr, name, reason: DisconnectReason::TimedOut }
            if *addr == bob && name == "bob"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::RosterChanged { names } if names == &["host", "alice"]
    )));

    let roster = last_sent
        .iter()
        .find(|(to, e)| *to == alice && e.kind == MessageKind::Roster)
        .map(|(_, e)| decode_roster_payload(&e.payload).unwrap());
    assert_eq!(roster, Some(vec!["host".to_string(), "alice".to_string()]));
    assert!(!last_sent.iter().any(|(to, e)| {
        *to == bob
            && e.kind == MessageKind::Roster
            && decode_roster_payload(&e.payload).unwrap().len() == 2
    }));
}

#[test]
fn test_client_closes_when_host_goes_silent() {
    let t0 = Instant::now();
    let mut client = Node::client(addr(6001), "alice", TransportConfig::default(), t0);

    for step in 1..=14u64 {
        client.session.tick_at(at(t0, step * 100));
        assert!(!client.session.is_closed());
    }
    client.session.tick_at(at(t0, 1500));

    assert!(client.session.is_closed());
    assert!(client.events().iter().any(|e| matches!(
        e,
        SessionEvent::HostLost {
            reason: DisconnectReason::TimedOut
        }
    )));
    assert!(matches!(
        client.session.send_to_host("CHAT", "hello?"),
        Err(SendError::Closed)
    ));
}

#[test]
fn test_control_replies_never_acknowledged() {
    let t0 = Instant::now();
    let mut host = Node::host(TransportConfig::default(), t0);
    let alice = addr(6001);
    join(&mut host, alice, "alice", t0);
    host.wire.take();

    deliver(&host.inbox, alice, Envelope::new(1, MessageKind::Ping, "alice"));
    deliver(&host.inbox, alice, Envelope::new(2, MessageKind::Pong, "alice"));
    deliver(&host.inbox, alice, Envelope::new(3, MessageKind::Ack, "[]"));
    host.session.tick_at(at(t0, 10));

    let sent = host.wire.take();
    assert!(acked_ids(&sent, alice).is_empty());
    assert!(
        sent.iter()
            .any(|(to, e)| *to == alice && e.kind == MessageKind::Pong)
    );

    let peer = host.session.peer(&alice).unwrap();
    assert!(peer.acks.is_empty());
    assert!(peer.pending.iter().all(|p| p.envelope.kind.requires_ack()));
    assert_eq!(host.session.stats().duplicates_dropped, 0);
}

#[test]
fn test_reserved_and_unknown_targets_rejected() {
    let t0 = Instant::now();
    let mut host = Node::host(TransportConfig::default(), t0);
    let alice = addr(6001);
    join(&mut host, alice, "alice", t0);

    assert!(matches!(
        host.session.send(addr(7000), "CHAT", "x"),
        Err(SendError::UnknownPeer(a)) if a == addr(7000)
    ));
    assert!(matches!(
        host.session.send(alice, "PING", ""),
        Err(SendError::ReservedKind(kind)) if kind == "PING"
    ));
    assert!(matches!(
        host.session.broadcast("ACK", "[]"),
        Err(SendError::ReservedKind(_))
    ));
    assert!(matches!(
        host.session.send_to_host("CHAT", "x"),
        Err(SendError::NoHost)
    ));
    assert!(host.session.send(alice, "CHAT", "x").is_ok());
}

#[test]
fn test_registry_refuses_peers_beyond_capacity() {
    let t0 = Instant::now();
    let config = TransportConfig {
        max_peers: 1,
        ..Default::default()
    };
    let mut host = Node::host(config, t0);
    let bob = addr(6002);

    join(&mut host, addr(6001), "alice", t0);
    host.events();
    join(&mut host, bob, "bob", at(t0, 10));

    assert_eq!(host.session.peer_count(), 1);
    assert!(host.session.peer(&bob).is_none());
    assert!(host.events().is_empty());
    assert!(host.wire.take().iter().all(|(to, _)| *to != bob));
}

#[test]
fn test_host_relays_configured_kinds() {
    let t0 = Instant::now();
    let config = TransportConfig {
        relay_kinds: vec!["UI_Update".to_string()],
        ..Default::default()
    };
    let mut host = Node::host(config, t0);
    let alice = addr(6001);
    let bob = addr(6002);
    join(&mut host, alice, "alice", t0);
    join(&mut host, bob, "bob", t0);
    host.wire.take();
    host.events();

    let update = Envelope::new(1, MessageKind::from_tag("UI_Update"), r#"{"ready":true}"#);
    deliver(&host.inbox, alice, update);
    deliver(&host.inbox, alice, chat(2, "not relayed"));
    host.session.tick_at(at(t0, 10));

    let sent = host.wire.take();
    let relayed: Vec<&Envelope> = sent
        .iter()
        .filter(|(_, e)| e.kind.is_application())
        .map(|(to, e)| {
            assert_eq!(*to, bob);
            e
        })
        .collect();
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].kind.as_str(), "UI_Update");
    assert_eq!(relayed[0].payload, r#"{"ready":true}"#);
    assert!(host.session.peer(&bob).unwrap().pending.contains(relayed[0].id));

    // The host still sees both messages itself.
    let messages = host
        .events()
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::Message { .. }))
        .count();
    assert_eq!(messages, 2);
}

#[test]
fn test_leave_removes_peer_and_updates_roster() {
    let t0 = Instant::now();
    let mut host = Node::host(TransportConfig::default(), t0);
    let alice = addr(6001);
    let bob = addr(6002);
    join(&mut host, alice, "alice", t0);
    join(&mut host, bob, "bob", t0);
    assert_eq!(host.session.roster(), ["host", "alice", "bob"]);
    host.events();
    host.wire.take();

    deliver(&host.inbox, bob, Envelope::new(1, MessageKind::Leave, "bob"));
    host.session.tick_at(at(t0, 10));

    let events = host.events();
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::PeerLeft { addr, reason: DisconnectReason::Left, .. } if *addr == bob
    )));
    assert_eq!(host.session.roster(), ["host", "alice"]);
    assert!(host.session.peer(&bob).is_none());

    let sent = host.wire.take();
    assert!(
        sent.iter()
            .any(|(to, e)| *to == alice && e.kind == MessageKind::Roster)
    );
}

#[test]
fn test_host_leave_ends_client_session() {
    let t0 = Instant::now();
    let config = TransportConfig::default();
    let mut host = Node::host(config.clone(), t0);
    let mut client = Node::client(addr(6001), "alice", config, t0);
    handshake(&mut host, &mut client, t0);
    client.events();

    host.session.leave();
    assert!(host.session.is_closed());
    assert_eq!(host.session.peer_count(), 0);

    assert_eq!(shuttle(&host, &client), 1);
    client.session.tick_at(at(t0, 10));

    assert!(client.session.is_closed());
    assert!(client.events().iter().any(|e| matches!(
        e,
        SessionEvent::HostLost {
            reason: DisconnectReason::Left
        }
    )));
}

#[test]
fn test_client_leave_is_sent_once() {
    let t0 = Instant::now();
    let mut client = Node::client(addr(6001), "alice", TransportConfig::default(), t0);
    client.wire.take();

    client.session.leave();
    let sent = client.wire.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, HOST);
    assert_eq!(sent[0].1.kind, MessageKind::Leave);

    client.session.tick_at(at(t0, 2000));
    assert!(client.wire.take().is_empty());
}

#[test]
fn test_join_without_name_gets_placeholder() {
    let t0 = Instant::now();
    let mut host = Node::host(TransportConfig::default(), t0);
    let alice = addr(6001);
    join(&mut host, alice, "  ", t0);

    assert!(host.events().iter().any(|e| matches!(
        e,
        SessionEvent::PeerJoined { name, .. } if name == "Player 1"
    )));
}

#[test]
fn test_client_ignores_strangers() {
    let t0 = Instant::now();
    let mut client = Node::client(addr(6001), "alice", TransportConfig::default(), t0);

    deliver(&client.inbox, addr(9999), chat(1, "spam"));
    client.session.tick_at(at(t0, 10));

    assert!(client.events().is_empty());
    assert_eq!(client.session.peer_count(), 1);
    assert_eq!(client.session.stats().datagrams_received, 0);
}

#[test]
fn test_malformed_count_reported() {
    let t0 = Instant::now();
    let mut host = Node::host(TransportConfig::default(), t0);

    host.inbox.record_malformed();
    host.inbox.record_malformed();
    host.session.tick_at(at(t0, 10));

    assert_eq!(host.session.stats().malformed_dropped, 2);
}

#[test]
fn test_ack_burst_split_across_datagrams() {
    let t0 = Instant::now();
    let mut host = Node::host(TransportConfig::default(), t0);
    let alice = addr(6001);
    join(&mut host, alice, "alice", t0);
    host.wire.take();

    let burst: Vec<u64> = (1_000_000..1_000_300).collect();
    for &id in &burst {
        deliver(&host.inbox, alice, chat(id, "spam"));
    }
    host.session.tick_at(at(t0, 10));

    // An ACK too large to encode never reaches the wire.
    let sent = host.wire.take();
    let acks = sent
        .iter()
        .filter(|(to, e)| *to == alice && e.kind == MessageKind::Ack)
        .count();
    assert!(acks > 1);

    let mut acked = acked_ids(&sent, alice);
    acked.sort_unstable();
    assert_eq!(acked, burst);
    assert!(host.session.peer(&alice).unwrap().acks.is_empty());
}

#[test]
fn test_timed_out_peer_told_to_leave() {
    let t0 = Instant::now();
    let mut host = Node::host(TransportConfig::default(), t0);
    let alice = addr(6001);
    join(&mut host, alice, "alice", t0);

    for step in 1..=3u64 {
        host.session.tick_at(at(t0, step * 500));
    }
    assert!(host.session.peer(&alice).is_none());
    host.events();
    host.wire.take();

    // A late ping from the dropped client does not bring it back.
    deliver(&host.inbox, alice, Envelope::new(9, MessageKind::Ping, "alice"));
    host.session.tick_at(at(t0, 1600));

    assert!(host.session.peer(&alice).is_none());
    assert!(host.events().is_empty());
    let sent = host.wire.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, alice);
    assert_eq!(sent[0].1.kind, MessageKind::Leave);

    // A stray LEAVE is not answered.
    deliver(&host.inbox, alice, Envelope::new(10, MessageKind::Leave, "alice"));
    host.session.tick_at(at(t0, 1610));
    assert!(host.wire.take().is_empty());

    join(&mut host, alice, "alice", at(t0, 1620));
    assert_eq!(host.session.roster(), ["host", "alice"]);
}

#[test]
fn test_dropped_client_learns_it_was_removed() {
    let t0 = Instant::now();
    let config = TransportConfig::default();
    let mut host = Node::host(config.clone(), t0);
    let mut client = Node::client(addr(6001), "alice", config, t0);
    handshake(&mut host, &mut client, t0);

    // The host drops alice while her datagrams are not getting through.
    for step in 1..=3u64 {
        host.session.tick_at(at(t0, step * 500));
    }
    assert!(host.session.peer(&client.addr).is_none());
    client.wire.take();
    host.wire.take();

    deliver(&host.inbox, client.addr, Envelope::new(50, MessageKind::Ping, "alice"));
    host.session.tick_at(at(t0, 1510));
    shuttle(&host, &client);
    client.session.tick_at(at(t0, 1510));

    assert!(client.session.is_closed());
    assert!(client.events().iter().any(|e| matches!(
        e,
        SessionEvent::HostLost {
            reason: DisconnectReason::Left
        }
    )));
}

#[test]
fn test_leave_ignored_while_join_pending() {
    let t0 = Instant::now();
    let mut client = Node::client(addr(6001), "alice", TransportConfig::default(), t0);

    // The host saw a ping before our JOIN and answered with LEAVE.
    deliver(&client.inbox, HOST, Envelope::new(3, MessageKind::Leave, "host"));
    client.session.tick_at(at(t0, 10));

    assert!(!client.session.is_closed());
    assert!(client.events().is_empty());
    assert!(
        client
            .session
            .peer(&HOST)
            .unwrap()
            .pending
            .iter()
            .any(|p| p.envelope.kind == MessageKind::Join)
    );
}

#[test]
fn test_host_announcement_reaches_every_peer() {
    let t0 = Instant::now();
    let mut host = Node::host(TransportConfig::default(), t0);
    let alice = addr(6001);
    let bob = addr(6002);
    join(&mut host, alice, "alice", t0);
    join(&mut host, bob, "bob", t0);
    host.wire.take();

    let id = host.session.broadcast("CHAT", "* bob joined").unwrap();

    let sent = host.wire.take();
    let mut targets: Vec<SocketAddr> = sent
        .iter()
        .filter(|(_, e)| e.id == id && e.payload == "* bob joined")
        .map(|(to, _)| *to)
        .collect();
    targets.sort();
    assert_eq!(targets, vec![alice, bob]);
    assert!(host.session.peer(&alice).unwrap().pending.contains(id));
    assert!(host.session.peer(&bob).unwrap().pending.contains(id));
}
