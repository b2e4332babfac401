use std::io::{self, BufRead};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError, bounded};

use partyline::{Session, SessionError, SessionEvent};

use crate::config::ClientConfig;

pub const CHAT_KIND: &str = "CHAT";

fn spawn_console() -> io::Result<Receiver<String>> {
    let (tx, rx) = bounded(64);

    thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })?;

    Ok(rx)
}

/// Client side of the chat lobby. Typed lines go to the host as CHAT and
/// come back prefixed with our name once the host relays them.
pub struct ChatClient {
    session: Session,
    console: Receiver<String>,
    tick_duration: Duration,
    running: bool,
}

impl ChatClient {
    pub fn new(config: ClientConfig) -> Result<Self, SessionError> {
        let session = Session::join_from(
            config.bind.as_str(),
            config.transport,
            config.host,
            &config.name,
        )?;

        Ok(Self {
            session,
            console: spawn_console()?,
            tick_duration: Duration::from_secs_f64(1.0 / config.tick_rate as f64),
            running: true,
        })
    }

    pub fn run(&mut self) {
        let mut next_tick = Instant::now();

        while self.running {
            self.tick_once();

            next_tick += self.tick_duration;
            let now = Instant::now();
            if next_tick > now {
                thread::sleep(next_tick - now);
            } else {
                next_tick = now;
            }
        }

        if !self.session.is_closed() {
            self.session.leave();
        }
    }

    pub fn tick_once(&mut self) {
        self.session.tick();

        let events: Vec<SessionEvent> = self.session.drain_events().collect();
        for event in events {
            self.handle_event(event);
        }

        if self.running {
            self.read_console();
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::RosterChanged { names } => {
                println!("* players: {}", names.join(", "));
            }
            SessionEvent::Message { envelope, .. } => {
                if envelope.kind.as_str() == CHAT_KIND {
                    println!("{}", envelope.payload);
                } else {
                    log::debug!("Unhandled {}: {}", envelope.kind, envelope.payload);
                }
            }
            SessionEvent::DeliveryLost { envelope, .. } => {
                if envelope.kind.as_str() == CHAT_KIND {
                    println!("* message not delivered: {}", envelope.payload);
                }
            }
            SessionEvent::HostLost { reason } => {
                println!("* host {}", reason.as_str());
                self.running = false;
            }
            SessionEvent::PeerConnected { .. }
            | SessionEvent::PeerJoined { .. }
            | SessionEvent::PeerLeft { .. } => {}
        }
    }

    fn read_console(&mut self) {
        loop {
            match self.console.try_recv() {
                Ok(line) => self.handle_line(line.trim()),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    log::info!("Console closed, leaving");
                    self.running = false;
                    break;
                }
            }
        }
    }

    fn handle_line(&mut self, line: &str) {
        match line {
            "" => {}
            "/quit" => self.running = false,
            "/players" => println!("* players: {}", self.session.roster().join(", ")),
            text => {
                if let Err(e) = self.session.send_to_host(CHAT_KIND, text) {
                    log::warn!("Chat not sent: {}", e);
                }
            }
        }
    }
}
