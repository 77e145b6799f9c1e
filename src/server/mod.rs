//! Relay server
//!
//! Two listeners share one meeting registry: the TCP control plane
//! ([`control`]) and the UDP media relay ([`relay`]).

pub mod control;
pub mod registry;
pub mod relay;

pub use registry::{ClientId, MeetingRegistry};

use log::info;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};

/// A bound but not yet running server.
pub struct Server {
    registry: Arc<MeetingRegistry>,
    tcp: TcpListener,
    udp: UdpSocket,
}

impl Server {
    /// Bind both sockets. Failing to bind either is fatal for the caller.
    pub async fn bind(host: &str, tcp_port: u16, udp_port: u16) -> io::Result<Self> {
        let tcp = TcpListener::bind((host, tcp_port)).await?;
        let udp = UdpSocket::bind((host, udp_port)).await?;
        Ok(Self {
            registry: Arc::new(MeetingRegistry::new()),
            tcp,
            udp,
        })
    }

    /// Actual control-plane address (useful when bound to port 0).
    pub fn tcp_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    /// Actual relay address.
    pub fn udp_addr(&self) -> io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    pub fn registry(&self) -> Arc<MeetingRegistry> {
        self.registry.clone()
    }

    /// Run both planes until the process is stopped.
    pub async fn run(self) {
        info!(
            "control plane on {}, media relay on {}",
            self.tcp
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            self.udp
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default()
        );
        let relay_registry = self.registry.clone();
        tokio::select! {
            _ = control::run_control_plane(self.tcp, self.registry) => {}
            _ = relay::run_relay(self.udp, relay_registry) => {}
        }
    }
}
