//! Datagram transports
//!
//! The worker only sees signed byte strings addressed by member name. The UDP
//! transport resolves names at send time; the in-memory network wires nodes
//! together inside one process and can cut links between them.

use crate::{GossipError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use swim_core::MemberName;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// A received datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub bytes: Vec<u8>,

    /// Transport-level sender address
    pub from: String,
}

/// Send and receive capability used by the worker
#[async_trait]
pub trait Transport: Send + Sync {
    /// Name this transport is reachable under
    fn local_name(&self) -> &MemberName;

    /// Send one datagram to a member
    async fn send_to(&self, bytes: &[u8], target: &MemberName) -> Result<()>;

    /// Send the same datagram to several members, logging individual failures
    async fn broadcast(&self, bytes: &[u8], targets: &[MemberName]) -> Result<()> {
        let mut failed = 0;
        for target in targets {
            if let Err(e) = self.send_to(bytes, target).await {
                debug!("Broadcast to {} failed: {}", target, e);
                failed += 1;
            }
        }

        if failed > 0 {
            warn!("Broadcast failed for {} of {} members", failed, targets.len());
        }
        Ok(())
    }

    /// Wait for the next datagram. Returns `None` once the transport is closed.
    async fn recv(&self) -> Option<Datagram>;

    /// Close the transport, waking any pending `recv`
    async fn close(&self);
}

/// UDP socket transport
pub struct UdpTransport {
    socket: UdpSocket,
    local_name: MemberName,
    max_packet_size: usize,
    closed: watch::Sender<bool>,
}

impl UdpTransport {
    /// Bind `bind_addr` and serve as `local_name`
    pub async fn bind(bind_addr: &str, local_name: MemberName, max_packet_size: usize) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        info!("UDP transport for {} bound on {}", local_name, socket.local_addr()?);

        let (closed, _) = watch::channel(false);
        Ok(Self {
            socket,
            local_name,
            max_packet_size,
            closed,
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_name(&self) -> &MemberName {
        &self.local_name
    }

    async fn send_to(&self, bytes: &[u8], target: &MemberName) -> Result<()> {
        if *self.closed.borrow() {
            return Err(GossipError::Transport("transport closed".to_string()));
        }

        if bytes.len() > self.max_packet_size {
            return Err(GossipError::Transport(format!(
                "Datagram too large: {} bytes (max: {})",
                bytes.len(),
                self.max_packet_size
            )));
        }

        let addr = lookup_host(target.as_str())
            .await?
            .next()
            .ok_or_else(|| GossipError::Transport(format!("No address for {}", target)))?;

        let sent = self.socket.send_to(bytes, addr).await?;
        if sent != bytes.len() {
            warn!("Partial send: {} of {} bytes to {}", sent, bytes.len(), target);
        }
        Ok(())
    }

    async fn recv(&self) -> Option<Datagram> {
        let mut closed = self.closed.subscribe();
        // Room for one byte over the limit so oversize datagrams are detectable
        let mut buf = vec![0u8; self.max_packet_size + 1];

        loop {
            if *closed.borrow_and_update() {
                return None;
            }

            tokio::select! {
                _ = closed.changed() => return None,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, from)) if len > self.max_packet_size => {
                        warn!("Dropping oversize datagram from {}", from);
                    }
                    Ok((len, from)) => {
                        return Some(Datagram {
                            bytes: buf[..len].to_vec(),
                            from: from.to_string(),
                        });
                    }
                    Err(e) => {
                        warn!("UDP receive error: {}", e);
                    }
                },
            }
        }
    }

    async fn close(&self) {
        if !self.closed.send_replace(true) {
            info!("UDP transport for {} closed", self.local_name);
        }
    }
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<MemberName, mpsc::UnboundedSender<Datagram>>,
    blocked: HashSet<(MemberName, MemberName)>,
    isolated: HashSet<MemberName>,
}

impl NetworkState {
    fn is_blocked(&self, from: &MemberName, to: &MemberName) -> bool {
        self.isolated.contains(from)
            || self.isolated.contains(to)
            || self.blocked.contains(&(from.clone(), to.clone()))
    }
}

/// In-process datagram network for simulations and tests
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint named `name`
    pub async fn bind(&self, name: MemberName) -> Result<MemoryTransport> {
        let mut state = self.state.lock().await;
        if state.endpoints.contains_key(&name) {
            return Err(GossipError::Transport(format!("{} is already bound", name)));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.endpoints.insert(name.clone(), tx);
        let (closed, _) = watch::channel(false);

        Ok(MemoryTransport {
            name,
            network: self.clone(),
            rx: Mutex::new(rx),
            closed,
        })
    }

    /// Drop all traffic between `a` and `b`, both directions
    pub async fn partition(&self, a: &MemberName, b: &MemberName) {
        let mut state = self.state.lock().await;
        state.blocked.insert((a.clone(), b.clone()));
        state.blocked.insert((b.clone(), a.clone()));
    }

    pub async fn heal(&self, a: &MemberName, b: &MemberName) {
        let mut state = self.state.lock().await;
        state.blocked.remove(&(a.clone(), b.clone()));
        state.blocked.remove(&(b.clone(), a.clone()));
    }

    /// Drop all traffic to and from `name`
    pub async fn isolate(&self, name: &MemberName) {
        self.state.lock().await.isolated.insert(name.clone());
    }

    pub async fn heal_all(&self) {
        let mut state = self.state.lock().await;
        state.blocked.clear();
        state.isolated.clear();
    }

    async fn deliver(&self, from: &MemberName, to: &MemberName, bytes: &[u8]) {
        let state = self.state.lock().await;
        if state.is_blocked(from, to) {
            return;
        }

        if let Some(tx) = state.endpoints.get(to) {
            let _ = tx.send(Datagram {
                bytes: bytes.to_vec(),
                from: from.to_string(),
            });
        }
    }

    async fn unbind(&self, name: &MemberName) {
        self.state.lock().await.endpoints.remove(name);
    }
}

/// Endpoint on a [`MemoryNetwork`]
pub struct MemoryTransport {
    name: MemberName,
    network: MemoryNetwork,
    rx: Mutex<mpsc::UnboundedReceiver<Datagram>>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_name(&self) -> &MemberName {
        &self.name
    }

    /// Datagrams to unknown or partitioned members are silently lost
    async fn send_to(&self, bytes: &[u8], target: &MemberName) -> Result<()> {
        if *self.closed.borrow() {
            return Err(GossipError::Transport("transport closed".to_string()));
        }
        self.network.deliver(&self.name, target, bytes).await;
        Ok(())
    }

    async fn recv(&self) -> Option<Datagram> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return None;
        }

        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = closed.changed() => None,
            datagram = rx.recv() => datagram,
        }
    }

    async fn close(&self) {
        if !self.closed.send_replace(true) {
            self.network.unbind(&self.name).await;
            debug!("Memory transport {} closed", self.name);
        }
    }
}
