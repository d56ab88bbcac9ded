//! Datagram transport for JoinReq / JoinAns
//!
//! One JSON JoinReq per datagram, answered with one JoinAns datagram to the
//! sender. The sender's socket address is mapped to the NetID configured for
//! it; that mapping is the only peer authentication this listener performs.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::interop::{JoinServer, RequestContext};
use crate::lorawan::NetId;

pub struct JoinListener {
    socket: Arc<UdpSocket>,
    server: Arc<JoinServer>,
    peers: Arc<HashMap<SocketAddr, NetId>>,
    deadline: Duration,
}

impl JoinListener {
    pub async fn bind(
        addr: &str,
        server: Arc<JoinServer>,
        peers: HashMap<SocketAddr, NetId>,
        deadline: Duration,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("JoinReq listener on {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
            server,
            peers: Arc::new(peers),
            deadline,
        })
    }

    pub async fn from_config(config: &Config, server: Arc<JoinServer>) -> anyhow::Result<Self> {
        Self::bind(
            &config.server.bind,
            server,
            config.peer_addresses()?,
            config.answer_deadline(),
        )
        .await
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve until `true` is published on `shutdown` (or its sender is
    /// dropped). In-flight requests observe the same signal.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut buf = vec![0u8; 65535];

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, src) = received?;
                    debug!("Received {} bytes from {}", len, src);
                    self.dispatch(buf[..len].to_vec(), src, shutdown.clone());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("JoinReq listener stopping");
                        return Ok(());
                    }
                }
            }
        }
    }

    fn dispatch(&self, datagram: Vec<u8>, src: SocketAddr, shutdown: watch::Receiver<bool>) {
        let authenticated = self.peers.get(&src).copied();
        if authenticated.is_none() {
            warn!("Datagram from unconfigured address {}", src);
        }

        let socket = self.socket.clone();
        let server = self.server.clone();
        let deadline = self.deadline;

        tokio::spawn(async move {
            let mut ctx = RequestContext::with_timeout(deadline).cancel_on(shutdown);
            match server.handle_raw(&datagram, authenticated, &mut ctx).await {
                Ok(reply) => {
                    if let Err(e) = socket.send_to(&reply, src).await {
                        error!("Failed to send JoinAns to {}: {}", src, e);
                    }
                }
                Err(e) => error!("Failed to encode JoinAns for {}: {}", src, e),
            }
        });
    }
}
