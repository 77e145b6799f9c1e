//! Client-side control channel
//!
//! One framed TCP connection to the server. A background thread reads
//! frames into an inbox channel; sends are serialized under a write lock so
//! each frame goes out atomically.

use crate::protocol::framing::{self, ProtocolError};
use crate::protocol::ControlMessage;
use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::error::Error;
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Dial timeout for the initial connect.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Control channel failures.
#[derive(Debug)]
pub enum ControlError {
    /// Could not resolve or dial the server
    Connect(io::Error),
    /// The connection is gone
    Closed,
    /// Socket or framing fault while sending
    Send(ProtocolError),
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::Connect(e) => write!(f, "failed to connect: {}", e),
            ControlError::Closed => write!(f, "control connection closed"),
            ControlError::Send(e) => write!(f, "failed to send: {}", e),
        }
    }
}

impl Error for ControlError {}

/// A connected control channel. Cloneable via `Arc`; the receive side is a
/// separate inbox handed out at connect time.
pub struct ControlChannel {
    writer: Mutex<TcpStream>,
    reader_stream: TcpStream,
    running: Arc<AtomicBool>,
    peer: SocketAddr,
}

impl ControlChannel {
    /// Dial the server and start the receive thread. Returns the channel
    /// and the inbox of incoming messages; the inbox disconnects when the
    /// server closes the socket.
    pub fn connect(
        host: &str,
        port: u16,
    ) -> Result<(Arc<Self>, Receiver<ControlMessage>), ControlError> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(ControlError::Connect)?
            .next()
            .ok_or_else(|| {
                ControlError::Connect(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("{}:{} did not resolve", host, port),
                ))
            })?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(ControlError::Connect)?;
        stream.set_nodelay(true).ok();
        info!("connected to control plane at {}", addr);

        let reader = stream.try_clone().map_err(ControlError::Connect)?;
        let running = Arc::new(AtomicBool::new(true));
        let channel = Arc::new(Self {
            writer: Mutex::new(stream),
            reader_stream: reader.try_clone().map_err(ControlError::Connect)?,
            running: running.clone(),
            peer: addr,
        });

        let (tx, rx) = unbounded();
        let thread_running = running;
        std::thread::Builder::new()
            .name("control-recv".into())
            .spawn(move || receive_loop(reader, tx, thread_running))
            .map_err(ControlError::Connect)?;

        Ok((channel, rx))
    }

    /// Serialize and send one message as a single frame.
    pub fn send(&self, msg: &ControlMessage) -> Result<(), ControlError> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(ControlError::Closed);
        }
        let mut writer = self.writer.lock();
        framing::write_message(&mut *writer, msg).map_err(|e| {
            self.running.store(false, Ordering::Relaxed);
            ControlError::Send(e)
        })
    }

    pub fn is_connected(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Stop the receive thread and close the socket.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::Relaxed) {
            let _ = self.reader_stream.shutdown(Shutdown::Both);
            info!("control channel to {} shut down", self.peer);
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn receive_loop(
    mut reader: TcpStream,
    inbox: Sender<ControlMessage>,
    running: Arc<AtomicBool>,
) {
    loop {
        if !running.load(Ordering::Relaxed) {
            break;
        }
        match framing::read_message(&mut reader) {
            Ok(Some(msg)) => {
                debug!("control <- {}", msg.kind());
                if inbox.send(msg).is_err() {
                    break;
                }
            }
            Ok(None) => {
                info!("server closed the control connection");
                break;
            }
            Err(e) => {
                if running.load(Ordering::Relaxed) {
                    warn!("control receive failed: {}", e);
                }
                break;
            }
        }
    }
    running.store(false, Ordering::Relaxed);
    // Dropping the inbox sender disconnects the session's receive side.
}
