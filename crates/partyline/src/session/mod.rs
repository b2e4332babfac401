//! The tick-driven session: one explicitly constructed object per role that
//! owns every piece of protocol state and performs every transmission.
//!
//! Only [`Inbox`] crosses threads. The receive worker pushes decoded
//! envelopes into it; [`Session::tick_at`] drains it, updates peer state,
//! dispatches application messages, flushes acknowledgements, retransmits
//! overdue messages and runs heartbeats. Nothing here blocks.

mod dispatch;
mod error;
mod events;

pub use dispatch::{Delivery, HandlerRegistry, MessageHandler};
pub use error::{SendError, SessionError};
pub use events::{DisconnectReason, SessionEvent};

use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Instant;

use crate::config::TransportConfig;
use crate::net::{
    DatagramSink, Envelope, EnvelopeError, HeartbeatAction, HeartbeatSchedule, IdGenerator,
    Inbound, Inbox, LossySink, MAX_ACK_IDS, MessageKind, NetworkEndpoint, NetworkStats,
    PacketLossSimulation,
    PeerConnection, PeerRegistry, check_peer, decode_ack_payload, decode_roster_payload,
    encode_ack_payload, encode_roster_payload,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Tracks every peer that talks to it and keeps the roster.
    Host,
    /// Talks to exactly one fixed peer, the host.
    Client { host: SocketAddr },
}

pub struct Session {
    role: Role,
    config: TransportConfig,
    local_name: String,
    registry: PeerRegistry,
    ids: IdGenerator,
    sink: Box<dyn DatagramSink>,
    inbox: Inbox,
    endpoint: Option<NetworkEndpoint>,
    handlers: HandlerRegistry,
    heartbeat: HeartbeatSchedule,
    events: VecDeque<SessionEvent>,
    roster: Vec<String>,
    stats: NetworkStats,
    clock: Instant,
    closed: bool,
}

impl Session {
    /// Opens a host session listening on `0.0.0.0:<config.port>`.
    pub fn host(config: TransportConfig, local_name: &str) -> Result<Self, SessionError> {
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        Self::host_on(bind_addr, config, local_name)
    }

    pub fn host_on<A: ToSocketAddrs>(
        bind_addr: A,
        config: TransportConfig,
        local_name: &str,
    ) -> Result<Self, SessionError> {
        Self::open(bind_addr, Role::Host, config, local_name)
    }

    /// Opens a client session on an ephemeral port and sends JOIN to `host`.
    pub fn join(
        config: TransportConfig,
        host: SocketAddr,
        local_name: &str,
    ) -> Result<Self, SessionError> {
        let bind_addr = if host.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        Self::join_from(bind_addr, config, host, local_name)
    }

    pub fn join_from<A: ToSocketAddrs>(
        bind_addr: A,
        config: TransportConfig,
        host: SocketAddr,
        local_name: &str,
    ) -> Result<Self, SessionError> {
        Self::open(bind_addr, Role::Client { host }, config, local_name)
    }

    fn open<A: ToSocketAddrs>(
        bind_addr: A,
        role: Role,
        config: TransportConfig,
        local_name: &str,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let inbox = Inbox::new();
        let endpoint = NetworkEndpoint::bind(bind_addr, inbox.clone())?;

        let sink: Box<dyn DatagramSink> = if config.loss_percent > 0.0 {
            log::info!("Simulating {:.1}% outbound loss", config.loss_percent);
            Box::new(LossySink::new(
                endpoint.sender(),
                PacketLossSimulation::new(config.loss_percent),
            ))
        } else {
            Box::new(endpoint.sender())
        };

        log::info!(
            "{} session for '{}' on {}",
            match role {
                Role::Host => "Host",
                Role::Client { .. } => "Client",
            },
            local_name,
            endpoint.local_addr()
        );

        let mut session = Self::new(role, config, local_name, sink, inbox, Instant::now());
        session.endpoint = Some(endpoint);
        Ok(session)
    }

    /// Builds a session from parts. In the client role the host is
    /// registered immediately and a JOIN carrying `local_name` goes out.
    pub fn new(
        role: Role,
        config: TransportConfig,
        local_name: &str,
        sink: Box<dyn DatagramSink>,
        inbox: Inbox,
        now: Instant,
    ) -> Self {
        let mut heartbeat = HeartbeatSchedule::new(config.heartbeat_interval());
        heartbeat.poll(now);

        let mut session = Self {
            role,
            registry: PeerRegistry::new(config.max_peers, config.dedup_window),
            local_name: local_name.to_string(),
            ids: IdGenerator::new(),
            sink,
            inbox,
            endpoint: None,
            handlers: HandlerRegistry::new(),
            heartbeat,
            events: VecDeque::new(),
            roster: Vec::new(),
            stats: NetworkStats::default(),
            clock: now,
            closed: false,
            config,
        };

        match role {
            Role::Host => {
                session.roster = vec![session.local_name.clone()];
            }
            Role::Client { host } => {
                if let Err(e) = session.registry.connection_for(host, now) {
                    log::error!("Cannot register host: {}", e);
                }
                let join = session
                    .ids
                    .envelope(MessageKind::Join, session.local_name.clone());
                if let Err(e) = session.send_envelope(host, join) {
                    log::error!("Failed to encode JOIN: {}", e);
                }
            }
        }

        session
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref().map(|e| e.local_addr())
    }

    /// Producer handle for the inbound queue.
    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn peer(&self, addr: &SocketAddr) -> Option<&PeerConnection> {
        self.registry.get_by_addr(addr)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerConnection> {
        self.registry.iter()
    }

    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    /// Host: own name followed by joined peers. Client: the last roster received.
    pub fn roster(&self) -> &[String] {
        &self.roster
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = SessionEvent> + '_ {
        self.events.drain(..)
    }

    pub fn register_handler<F>(&mut self, kind: impl Into<String>, handler: F)
    where
        F: FnMut(&Delivery<'_>) + Send + 'static,
    {
        self.handlers.register(kind, handler);
    }

    /// Sends one application message to `to`. The returned id identifies the
    /// envelope until it is acknowledged or reported lost.
    pub fn send(
        &mut self,
        to: SocketAddr,
        kind: &str,
        payload: impl Into<String>,
    ) -> Result<u64, SendError> {
        let kind = self.application_kind(kind)?;
        if !self.registry.contains(&to) {
            return Err(SendError::UnknownPeer(to));
        }

        let envelope = self.ids.envelope(kind, payload);
        let id = envelope.id;
        self.send_envelope(to, envelope)?;
        Ok(id)
    }

    /// Client role shortcut for [`Session::send`] to the host.
    pub fn send_to_host(
        &mut self,
        kind: &str,
        payload: impl Into<String>,
    ) -> Result<u64, SendError> {
        match self.role {
            Role::Client { host } => self.send(host, kind, payload),
            Role::Host => Err(SendError::NoHost),
        }
    }

    /// Sends the same envelope to every joined peer (or to the host, for a client).
    /// Each copy is tracked separately in its peer's pending list.
    pub fn broadcast(&mut self, kind: &str, payload: impl Into<String>) -> Result<u64, SendError> {
        let kind = self.application_kind(kind)?;
        let envelope = self.ids.envelope(kind, payload);
        let id = envelope.id;
        self.broadcast_envelope(envelope, None)?;
        Ok(id)
    }

    fn application_kind(&self, kind: &str) -> Result<MessageKind, SendError> {
        if self.closed {
            return Err(SendError::Closed);
        }
        let kind = MessageKind::from_tag(kind);
        if !kind.is_application() {
            return Err(SendError::ReservedKind(kind.to_string()));
        }
        Ok(kind)
    }

    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// Runs one dispatcher pass with `now` as the tick clock.
    pub fn tick_at(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        self.clock = self.clock.max(now);
        self.stats.malformed_dropped = self.inbox.malformed_count();

        for inbound in self.inbox.drain() {
            self.handle_inbound(inbound);
            if self.closed {
                return;
            }
        }

        for addr in self.registry.addrs() {
            self.retransmit_overdue(addr);
            self.flush_acks(addr);
        }

        if self.heartbeat.poll(self.clock) {
            self.run_heartbeat();
        }
    }

    /// Sends LEAVE to every peer once, without waiting for acknowledgement,
    /// then closes the session.
    pub fn leave(&mut self) {
        if self.closed {
            return;
        }

        for addr in self.registry.addrs() {
            self.send_leave(addr);
        }

        self.shutdown();
    }

    /// Closes the session and stops the receive worker. Idempotent.
    pub fn shutdown(&mut self) {
        self.closed = true;
        self.registry.clear();
        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.shutdown();
            log::info!("Session on {} closed", endpoint.local_addr());
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        let Inbound {
            from,
            envelope,
            size,
        } = inbound;

        if let Role::Client { host } = self.role {
            if from != host {
                log::debug!("Ignoring {} from {}, not the host", envelope.kind, from);
                return;
            }
        }

        // Only JOIN opens a peer on the host. Anyone else is told to leave,
        // which lets a client we already timed out notice and join again.
        if self.role == Role::Host
            && envelope.kind != MessageKind::Join
            && !self.registry.contains(&from)
        {
            self.stats.record_received(size);
            if envelope.kind != MessageKind::Leave {
                log::debug!("{} from unjoined {}, answering LEAVE", envelope.kind, from);
                self.send_leave(from);
            }
            return;
        }

        let now = self.clock;
        let (peer, created) = match self.registry.connection_for(from, now) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("{}", e);
                return;
            }
        };
        peer.touch(now);

        let fresh = if envelope.kind.requires_ack() {
            peer.acks.push(envelope.id);
            peer.dedup.record(envelope.id)
        } else {
            true
        };

        self.stats.record_received(size);

        if created {
            log::info!("New peer from {}", from);
            self.events.push_back(SessionEvent::PeerConnected { addr: from });
        }

        if !fresh {
            self.stats.duplicates_dropped += 1;
            log::debug!("Duplicate {} #{} from {}", envelope.kind, envelope.id, from);
            return;
        }

        match &envelope.kind {
            MessageKind::Ping => {
                let pong = self.ids.envelope(MessageKind::Pong, self.local_name.clone());
                if let Err(e) = self.send_envelope(from, pong) {
                    log::warn!("Failed to encode PONG: {}", e);
                }
            }
            MessageKind::Pong => {}
            MessageKind::Ack => self.handle_ack(from, &envelope.payload),
            MessageKind::Join => self.handle_join(from, &envelope.payload),
            MessageKind::Leave => self.handle_leave(from),
            MessageKind::Roster => self.handle_roster(from, &envelope.payload),
            MessageKind::Application(kind) => {
                if self.role == Role::Host && self.config.relays(kind) {
                    self.relay(from, &envelope);
                }
                self.dispatch(from, envelope);
            }
        }
    }

    fn handle_ack(&mut self, from: SocketAddr, payload: &str) {
        let ids = match decode_ack_payload(payload) {
            Ok(ids) => ids,
            Err(e) => {
                log::warn!("Ignoring ACK from {}: {}", from, e);
                return;
            }
        };

        if let Some(peer) = self.registry.get_by_addr_mut(&from) {
            let retired = peer.pending.process_ack(&ids);
            log::trace!("{} acked {} of {:?}", from, retired, ids);
        }
    }

    fn handle_join(&mut self, from: SocketAddr, payload: &str) {
        if self.role != Role::Host {
            log::debug!("Ignoring JOIN from {}", from);
            return;
        }

        let Some(peer) = self.registry.get_by_addr_mut(&from) else {
            return;
        };

        let requested = payload.trim();
        let name = if requested.is_empty() {
            format!("Player {}", peer.id)
        } else {
            requested.to_string()
        };
        peer.name = name.clone();

        log::info!("{} joined from {}", name, from);
        self.events
            .push_back(SessionEvent::PeerJoined { addr: from, name });
        self.broadcast_roster();
    }

    fn handle_leave(&mut self, from: SocketAddr) {
        // A host that has not processed our JOIN yet answers stray traffic
        // with LEAVE; the JOIN retransmission still has to land.
        if let Role::Client { .. } = self.role {
            let joining = self.registry.get_by_addr(&from).is_some_and(|peer| {
                peer.pending
                    .iter()
                    .any(|p| p.envelope.kind == MessageKind::Join)
            });
            if joining {
                log::debug!("Ignoring LEAVE from {} while JOIN is pending", from);
                return;
            }
        }

        self.remove_peer(from, DisconnectReason::Left);
    }

    /// One untracked LEAVE; nobody waits for it to be acknowledged.
    fn send_leave(&mut self, to: SocketAddr) {
        let leave = self.ids.envelope(MessageKind::Leave, self.local_name.clone());
        match leave.encode() {
            Ok(bytes) => self.transmit(to, &bytes),
            Err(e) => log::warn!("Failed to encode LEAVE: {}", e),
        }
    }

    fn handle_roster(&mut self, from: SocketAddr, payload: &str) {
        if self.role == Role::Host {
            log::debug!("Ignoring roster from {}", from);
            return;
        }

        match decode_roster_payload(payload) {
            Ok(names) => {
                self.roster = names.clone();
                self.events.push_back(SessionEvent::RosterChanged { names });
            }
            Err(e) => log::warn!("Ignoring roster from {}: {}", from, e),
        }
    }

    fn dispatch(&mut self, from: SocketAddr, envelope: Envelope) {
        let sender = self
            .registry
            .get_by_addr(&from)
            .map(|p| p.label())
            .unwrap_or_else(|| from.to_string());

        let handled = self.handlers.dispatch(&Delivery {
            from,
            sender: &sender,
            envelope: &envelope,
        });

        if !handled {
            self.events.push_back(SessionEvent::Message {
                from,
                sender,
                envelope,
            });
        }
    }

    /// Host only: forwards an application envelope to every other joined peer
    /// under a fresh id of our own.
    fn relay(&mut self, from: SocketAddr, envelope: &Envelope) {
        let copy = self
            .ids
            .envelope(envelope.kind.clone(), envelope.payload.clone());
        if let Err(e) = self.broadcast_envelope(copy, Some(from)) {
            log::warn!("Failed to relay {} from {}: {}", envelope.kind, from, e);
        }
    }

    fn recipients(&self, except: Option<SocketAddr>) -> Vec<SocketAddr> {
        match self.role {
            Role::Client { host } => vec![host],
            Role::Host => {
                let mut peers: Vec<&PeerConnection> = self
                    .registry
                    .iter()
                    .filter(|p| p.has_joined() && Some(p.addr) != except)
                    .collect();
                peers.sort_by_key(|p| p.id);
                peers.into_iter().map(|p| p.addr).collect()
            }
        }
    }

    fn broadcast_envelope(
        &mut self,
        envelope: Envelope,
        except: Option<SocketAddr>,
    ) -> Result<(), EnvelopeError> {
        for addr in self.recipients(except) {
            self.send_envelope(addr, envelope.clone())?;
        }
        Ok(())
    }

    fn broadcast_roster(&mut self) {
        let mut names = vec![self.local_name.clone()];
        names.extend(self.registry.joined_names());
        self.roster = names.clone();

        let roster = self
            .ids
            .envelope(MessageKind::Roster, encode_roster_payload(&names));
        if let Err(e) = self.broadcast_envelope(roster, None) {
            log::warn!("Failed to broadcast roster: {}", e);
        }

        self.events.push_back(SessionEvent::RosterChanged { names });
    }

    fn remove_peer(&mut self, addr: SocketAddr, reason: DisconnectReason) {
        let Some(peer) = self.registry.remove(&addr) else {
            return;
        };

        match self.role {
            Role::Client { .. } => {
                log::warn!("Lost connection to host {} ({})", addr, reason.as_str());
                self.events.push_back(SessionEvent::HostLost { reason });
                self.shutdown();
            }
            Role::Host => {
                log::info!("{} {} ({})", peer.label(), reason.as_str(), addr);
                let joined = peer.has_joined();
                self.events.push_back(SessionEvent::PeerLeft {
                    addr,
                    name: peer.name,
                    reason,
                });
                if joined {
                    self.broadcast_roster();
                }
            }
        }
    }

    fn run_heartbeat(&mut self) {
        let now = self.clock;
        let interval = self.config.heartbeat_interval();
        let max_missed = self.config.max_missed_heartbeats;

        for addr in self.registry.addrs() {
            let Some(peer) = self.registry.get_by_addr_mut(&addr) else {
                continue;
            };

            match check_peer(peer, now, interval, max_missed) {
                HeartbeatAction::Idle => {}
                HeartbeatAction::Ping => {
                    let ping = self.ids.envelope(MessageKind::Ping, self.local_name.clone());
                    if let Err(e) = self.send_envelope(addr, ping) {
                        log::warn!("Failed to encode PING: {}", e);
                    }
                }
                HeartbeatAction::Disconnect => {
                    log::warn!(
                        "Peer {} missed {} heartbeats, disconnecting",
                        addr,
                        max_missed
                    );
                    self.remove_peer(addr, DisconnectReason::TimedOut);
                    if self.closed {
                        return;
                    }
                }
            }
        }
    }

    fn flush_acks(&mut self, addr: SocketAddr) {
        let Some(ids) = self
            .registry
            .get_by_addr_mut(&addr)
            .and_then(|peer| peer.acks.take())
        else {
            return;
        };

        // One tick can accept more ids than fit in a single datagram.
        for chunk in ids.chunks(MAX_ACK_IDS) {
            let ack = self
                .ids
                .envelope(MessageKind::Ack, encode_ack_payload(chunk));
            if let Err(e) = self.send_envelope(addr, ack) {
                log::warn!("Failed to encode ACK for {}: {}", addr, e);
            }
        }
    }

    /// Every outbound envelope goes through here: first the peer's overdue
    /// entries are retransmitted, then the new envelope is sent and, unless
    /// it is PING/PONG/ACK, tracked until acknowledged.
    fn send_envelope(&mut self, addr: SocketAddr, envelope: Envelope) -> Result<(), EnvelopeError> {
        self.retransmit_overdue(addr);

        let bytes = envelope.encode()?;
        self.transmit(addr, &bytes);

        if envelope.kind.requires_ack() {
            let now = self.clock;
            if let Some(peer) = self.registry.get_by_addr_mut(&addr) {
                peer.pending.track(envelope, bytes, now);
            }
        }

        Ok(())
    }

    fn retransmit_overdue(&mut self, addr: SocketAddr) {
        let ack_timeout = self.config.ack_timeout();
        let max_retries = self.config.max_retries;
        let now = self.clock;

        let Some(peer) = self.registry.get_by_addr_mut(&addr) else {
            return;
        };
        let scan = peer.pending.scan(now, ack_timeout, max_retries);
        if scan.is_empty() {
            return;
        }
        let label = peer.label();

        for envelope in scan.lost {
            self.stats.deliveries_lost += 1;
            if envelope.kind.requires_ack() {
                log::warn!(
                    "{} #{} to {} lost after {} retries",
                    envelope.kind,
                    envelope.id,
                    label,
                    max_retries
                );
            }
            self.events
                .push_back(SessionEvent::DeliveryLost { to: addr, envelope });
        }

        for (id, bytes) in scan.resend {
            self.stats.retransmissions += 1;
            log::debug!("Retransmitting #{} to {}", id, label);
            self.transmit(addr, &bytes);
        }
    }

    fn transmit(&mut self, addr: SocketAddr, bytes: &[u8]) {
        match self.sink.send_datagram(bytes, addr) {
            Ok(sent) => {
                self.stats.record_sent(sent);
                if let Some(peer) = self.registry.get_by_addr_mut(&addr) {
                    peer.last_sent = self.clock;
                }
            }
            Err(e) => {
                self.stats.send_failures += 1;
                log::warn!("Send to {} failed: {}", addr, e);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("local_name", &self.local_name)
            .field("peers", &self.registry.len())
            .field("closed", &self.closed)
            .finish()
    }
}
