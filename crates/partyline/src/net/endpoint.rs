use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use super::envelope::{Envelope, MAX_DATAGRAM_SIZE};
use super::inbox::{Inbound, Inbox};

/// How long a blocked receive waits before re-checking the stop flag.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Anything that can put one datagram on the wire.
pub trait DatagramSink: Send {
    fn send_datagram(&self, bytes: &[u8], addr: SocketAddr) -> io::Result<usize>;
}

impl<T: DatagramSink + Sync + ?Sized> DatagramSink for Arc<T> {
    fn send_datagram(&self, bytes: &[u8], addr: SocketAddr) -> io::Result<usize> {
        (**self).send_datagram(bytes, addr)
    }
}

/// Outbound half of the socket. Every send takes the lock so that sends
/// from different call sites on the tick thread never interleave on the wire.
#[derive(Debug)]
pub struct UdpSender {
    socket: Mutex<UdpSocket>,
}

impl UdpSender {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket: Mutex::new(socket),
        }
    }
}

impl DatagramSink for UdpSender {
    fn send_datagram(&self, bytes: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.lock().send_to(bytes, addr)
    }
}

/// A bound UDP socket plus the background thread that reads it.
///
/// The worker only decodes and enqueues; it never sees peer state.
pub struct NetworkEndpoint {
    local_addr: SocketAddr,
    sender: Arc<UdpSender>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl NetworkEndpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A, inbox: Inbox) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        let local_addr = socket.local_addr()?;

        let recv_socket = socket.try_clone()?;
        recv_socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;

        let running = Arc::new(AtomicBool::new(true));
        let worker_running = Arc::clone(&running);

        let worker = thread::Builder::new()
            .name(format!("partyline-recv-{}", local_addr.port()))
            .spawn(move || receive_loop(recv_socket, inbox, worker_running))?;

        log::debug!("Endpoint bound on {}", local_addr);

        Ok(Self {
            local_addr,
            sender: Arc::new(UdpSender::new(socket)),
            running,
            worker: Some(worker),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn sender(&self) -> Arc<UdpSender> {
        Arc::clone(&self.sender)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Raises the stop flag and waits for the worker to observe it.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Receive worker on {} panicked", self.local_addr);
            }
        }
    }
}

impl Drop for NetworkEndpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn receive_loop(socket: UdpSocket, inbox: Inbox, running: Arc<AtomicBool>) {
    // One byte of slack so oversize datagrams are detected rather than truncated.
    let mut buffer = [0u8; MAX_DATAGRAM_SIZE + 1];

    log::debug!("Receive worker started");

    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buffer) {
            Ok((size, from)) => match Envelope::decode(&buffer[..size]) {
                Ok(envelope) => inbox.push(Inbound {
                    from,
                    envelope,
                    size,
                }),
                Err(e) => {
                    inbox.record_malformed();
                    log::warn!("Dropping malformed datagram from {}: {}", from, e);
                }
            },
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted
                        | io::ErrorKind::ConnectionReset
                ) =>
            {
                continue;
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    log::error!("Receive worker stopping: {}", e);
                }
                break;
            }
        }
    }

    log::debug!("Receive worker stopped");
}
