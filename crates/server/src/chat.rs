use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError, bounded};

use partyline::{Session, SessionError, SessionEvent};

use crate::config::HostConfig;

pub const CHAT_KIND: &str = "CHAT";

/// Lines typed on the host console, read on a helper thread.
fn spawn_console() -> io::Result<Receiver<String>> {
    let (tx, rx) = bounded(64);

    thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!("Console read failed: {}", e);
                        break;
                    }
                }
            }
        })?;

    Ok(rx)
}

/// Runs the host side of a chat lobby: every CHAT a peer sends is echoed to
/// all joined peers with the sender's name in front.
pub struct ChatHost {
    session: Session,
    console: Option<Receiver<String>>,
    tick_duration: Duration,
    running: Arc<AtomicBool>,
}

impl ChatHost {
    pub fn new(config: HostConfig) -> Result<Self, SessionError> {
        let bind_addr = format!("{}:{}", config.bind, config.transport.port);
        let session = Session::host_on(bind_addr.as_str(), config.transport, &config.name)?;
        let console = spawn_console()?;

        Ok(Self {
            session,
            console: Some(console),
            tick_duration: Duration::from_secs_f64(1.0 / config.tick_rate as f64),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.session
            .local_addr()
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], self.session.config().port)))
    }

    pub fn run(&mut self) {
        let mut next_tick = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            self.tick_once();

            next_tick += self.tick_duration;
            let now = Instant::now();
            if next_tick > now {
                thread::sleep(next_tick - now);
            } else {
                next_tick = now;
            }
        }

        self.session.leave();
    }

    pub fn tick_once(&mut self) {
        self.session.tick();

        let events: Vec<SessionEvent> = self.session.drain_events().collect();
        for event in events {
            self.handle_event(event);
        }

        self.read_console();
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::PeerConnected { addr } => {
                log::debug!("Datagram from new address {}", addr);
            }
            SessionEvent::PeerJoined { name, .. } => {
                self.say(&format!("* {} joined", name));
            }
            SessionEvent::PeerLeft { addr, name, reason } => {
                let who = if name.is_empty() {
                    addr.to_string()
                } else {
                    name
                };
                self.say(&format!("* {} {}", who, reason.as_str()));
            }
            SessionEvent::RosterChanged { names } => {
                log::info!("Players: {}", names.join(", "));
            }
            SessionEvent::Message {
                sender, envelope, ..
            } => {
                if envelope.kind.as_str() == CHAT_KIND {
                    self.say(&format!("{}: {}", sender, envelope.payload));
                } else {
                    log::debug!("{} from {}: {}", envelope.kind, sender, envelope.payload);
                }
            }
            SessionEvent::DeliveryLost { to, envelope } => {
                log::debug!("{} #{} to {} given up", envelope.kind, envelope.id, to);
            }
            SessionEvent::HostLost { reason } => {
                log::error!("Host session ended: {}", reason.as_str());
                self.running.store(false, Ordering::SeqCst);
            }
        }
    }

    fn say(&mut self, line: &str) {
        println!("{}", line);
        if let Err(e) = self.session.broadcast(CHAT_KIND, line) {
            log::warn!("Chat not sent: {}", e);
        }
    }

    fn read_console(&mut self) {
        let Some(console) = &self.console else {
            return;
        };

        let mut lines = Vec::new();
        let mut closed = false;
        loop {
            match console.try_recv() {
                Ok(line) => lines.push(line),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    closed = true;
                    break;
                }
            }
        }

        if closed {
            log::info!("Console closed, host keeps running");
            self.console = None;
        }

        for line in lines {
            self.handle_command(line.trim());
        }
    }

    fn handle_command(&mut self, line: &str) {
        match line {
            "" => {}
            "/quit" => self.running.store(false, Ordering::SeqCst),
            "/players" => println!("Players: {}", self.session.roster().join(", ")),
            "/stats" => {
                let stats = self.session.stats();
                println!(
                    "sent {} ({} B), received {} ({} B)",
                    stats.datagrams_sent,
                    stats.bytes_sent,
                    stats.datagrams_received,
                    stats.bytes_received
                );
                println!(
                    "resent {}, lost {}, duplicates {}, malformed {}",
                    stats.retransmissions,
                    stats.deliveries_lost,
                    stats.duplicates_dropped,
                    stats.malformed_dropped
                );
            }
            text => {
                let line = format!("{}: {}", self.session.local_name(), text);
                self.say(&line);
            }
        }
    }
}
