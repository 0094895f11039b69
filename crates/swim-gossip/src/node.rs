//! High-level gossip node owning the worker tasks and the transport

use crate::{
    codec::{BincodePack, Codec, Pack},
    listener::{CallbackPoll, Listener},
    members::{MemberChange, Members, MembersStats},
    sign::Signatures,
    status::Status,
    transport::{Transport, UdpTransport},
    worker::Worker,
    GossipError, Result,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use swim_core::{Config, MemberName};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// A running cluster member.
///
/// Call [`GossipNode::stop`] to leave the cluster gracefully; dropping a
/// running node aborts its tasks without announcing the departure.
pub struct GossipNode {
    name: MemberName,
    members: Arc<RwLock<Members>>,
    worker: Arc<Worker>,
    transport: Arc<dyn Transport>,
    listener: Listener<MemberChange>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    running: bool,
}

impl GossipNode {
    pub fn builder(config: Config) -> GossipNodeBuilder {
        GossipNodeBuilder::new(config)
    }

    /// Start a node on a UDP socket bound per `config`
    pub async fn bind(config: &Config) -> Result<Self> {
        GossipNodeBuilder::new(config.clone()).build().await
    }

    /// Start a node on an already acquired transport
    pub async fn enter(config: &Config, transport: Arc<dyn Transport>) -> Result<Self> {
        GossipNodeBuilder::new(config.clone())
            .transport(transport)
            .build()
            .await
    }

    pub fn name(&self) -> &MemberName {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn members(&self) -> &Arc<RwLock<Members>> {
        &self.members
    }

    /// Snapshot of every member's status
    pub async fn get_status(&self) -> BTreeMap<MemberName, Status> {
        self.members.read().await.get_status()
    }

    pub async fn stats(&self) -> MembersStats {
        self.members.read().await.stats()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MemberChange> {
        self.listener.subscribe()
    }

    /// Run `callback` on every membership change until the poll is dropped
    pub fn on_change<F, Fut>(&self, callback: F) -> CallbackPoll
    where
        F: FnMut(MemberChange) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.listener.on_notify(callback)
    }

    /// Replace the metadata advertised for the local member
    pub async fn set_metadata(&self, payload: Vec<u8>) -> Result<u64> {
        if !self.running {
            return Err(GossipError::Protocol("Node not running".to_string()));
        }
        Ok(self.members.write().await.set_local_metadata(payload))
    }

    /// Leave the cluster, stop the tasks and close the transport
    pub async fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }

        info!("Stopping gossip node {}", self.name);

        if let Err(e) = self.worker.leave().await {
            error!("Failed to leave cluster gracefully: {}", e);
        }

        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("Gossip task failed: {}", e);
                }
            }
        }

        self.transport.close().await;
        self.running = false;
        Ok(())
    }
}

impl Drop for GossipNode {
    fn drop(&mut self) {
        if self.running {
            warn!("Gossip node {} dropped without stop, aborting tasks", self.name);
            for task in &self.tasks {
                task.abort();
            }
        }
    }
}

/// Builder for [`GossipNode`]
pub struct GossipNodeBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    pack: Option<Arc<dyn Pack>>,
    signature_version: Option<u8>,
}

impl GossipNodeBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            transport: None,
            pack: None,
            signature_version: None,
        }
    }

    /// Use `transport` instead of binding a UDP socket
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use `pack` instead of bincode
    pub fn pack(mut self, pack: Arc<dyn Pack>) -> Self {
        self.pack = Some(pack);
        self
    }

    pub fn signature_version(mut self, version: u8) -> Self {
        self.signature_version = Some(version);
        self
    }

    pub async fn build(self) -> Result<GossipNode> {
        let config = self.config;
        if let Err(e) = config.validate() {
            if e.is_fatal() {
                error!("Cannot start gossip node {}: {}", config.node.name, e);
            }
            return Err(e.into());
        }

        let secret = config.node.secret.as_deref().ok_or_else(|| {
            swim_core::Error::secret_unavailable("node.secret must be set")
        })?;
        let mut signatures = Signatures::new(secret)?;
        if let Some(version) = self.signature_version {
            signatures = signatures.with_version(version);
        }
        let pack = self
            .pack
            .unwrap_or_else(|| Arc::new(BincodePack::new(config.protocol.max_packet_size)));
        let codec = Codec::new(pack, signatures);

        let name = config.node.name.clone();
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                UdpTransport::bind(
                    config.node.bind_addr(),
                    name.clone(),
                    config.protocol.max_packet_size,
                )
                .await?,
            ),
        };

        if *transport.local_name() != name {
            return Err(GossipError::Configuration(format!(
                "transport is bound as {} but the local member is {}",
                transport.local_name(),
                name
            )));
        }

        let members = Members::new(name.clone(), config.node.metadata_bytes(), &config.node.peers);
        let listener = members.listener().clone();
        let members = Arc::new(RwLock::new(members));

        let worker = Arc::new(Worker::new(
            config.protocol.clone(),
            members.clone(),
            transport.clone(),
            codec,
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = worker.spawn(shutdown_rx);

        info!(
            "Gossip node {} started with {} seed peers",
            name,
            config.node.peers.len()
        );

        Ok(GossipNode {
            name,
            members,
            worker,
            transport,
            listener,
            shutdown,
            tasks,
            running: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    fn name(s: &str) -> MemberName {
        MemberName::new(s)
    }

    fn config(local: &str, peers: &[&str]) -> Config {
        let mut config = Config::default();
        config.node.name = name(local);
        config.node.peers = peers.iter().map(|p| name(p)).collect();
        config.node.secret = Some("cluster-secret".to_string());
        config
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    async fn start(network: &MemoryNetwork, local: &str, peers: &[&str]) -> GossipNode {
        init_tracing();
        let transport = Arc::new(network.bind(name(local)).await.unwrap());
        GossipNode::enter(&config(local, peers), transport).await.unwrap()
    }

    /// Wait until `observer` sees `member` in `status`, for at most `within`
    async fn eventually(observer: &GossipNode, member: &str, status: Status, within: Duration) {
        let deadline = Instant::now() + within;
        loop {
            let current = observer.get_status().await.get(&name(member)).copied();
            if current == Some(status) {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "{} sees {} as {:?}, expected {}",
                observer.name(),
                member,
                current,
                status
            );
            sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cluster_converges() {
        let network = MemoryNetwork::new();
        let mut a = start(&network, "a:1", &[]).await;
        let mut b = start(&network, "b:1", &["a:1"]).await;
        let mut c = start(&network, "c:1", &["a:1"]).await;

        for observer in [&a, &b, &c] {
            for member in ["a:1", "b:1", "c:1"] {
                eventually(observer, member, Status::Online, Duration::from_secs(10)).await;
            }
        }
        assert_eq!(a.stats().await.online, 3);

        a.stop().await.unwrap();
        b.stop().await.unwrap();
        c.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_isolated_member_suspected_then_recovers() {
        let network = MemoryNetwork::new();
        let mut a = start(&network, "a:1", &["b:1", "c:1"]).await;
        let mut b = start(&network, "b:1", &["a:1", "c:1"]).await;
        let mut c = start(&network, "c:1", &["a:1", "b:1"]).await;

        eventually(&a, "c:1", Status::Online, Duration::from_secs(10)).await;
        eventually(&b, "c:1", Status::Online, Duration::from_secs(10)).await;

        network.isolate(&name("c:1")).await;
        eventually(&a, "c:1", Status::Suspect, Duration::from_secs(10)).await;
        eventually(&a, "c:1", Status::Unavailable, Duration::from_secs(15)).await;
        eventually(&b, "c:1", Status::Unavailable, Duration::from_secs(15)).await;
        assert_eq!(a.get_status().await.get(&name("b:1")), Some(&Status::Online));

        network.heal_all().await;
        eventually(&a, "c:1", Status::Online, Duration::from_secs(10)).await;
        eventually(&b, "c:1", Status::Online, Duration::from_secs(10)).await;
        eventually(&c, "a:1", Status::Online, Duration::from_secs(10)).await;

        a.stop().await.unwrap();
        b.stop().await.unwrap();
        c.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_announces_departure() {
        let network = MemoryNetwork::new();
        let mut a = start(&network, "a:1", &[]).await;
        let mut b = start(&network, "b:1", &["a:1"]).await;
        eventually(&a, "b:1", Status::Online, Duration::from_secs(10)).await;

        let mut changes = a.subscribe();
        b.stop().await.unwrap();
        assert!(!b.is_running());
        b.stop().await.unwrap();

        eventually(&a, "b:1", Status::Offline, Duration::from_secs(2)).await;
        loop {
            let change = changes.recv().await.unwrap();
            if change.name == name("b:1") {
                assert_eq!(change.status, Status::Offline);
                break;
            }
        }

        assert!(matches!(
            b.set_metadata(b"late".to_vec()).await,
            Err(GossipError::Protocol(_))
        ));
        a.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_propagates() {
        let network = MemoryNetwork::new();
        let mut a = start(&network, "a:1", &[]).await;
        let mut b = start(&network, "b:1", &["a:1"]).await;
        eventually(&b, "a:1", Status::Online, Duration::from_secs(10)).await;

        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let _poll = b.on_change(move |change| {
            let tx = tx.clone();
            async move {
                if change.metadata.payload.as_deref() == Some(&b"zone=eu"[..]) {
                    let _ = tx.send(change.name).await;
                }
            }
        });

        a.set_metadata(b"zone=eu".to_vec()).await.unwrap();
        let updated = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap();
        assert_eq!(updated, Some(name("a:1")));

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_build_rejects_bad_setup() {
        let network = MemoryNetwork::new();

        let mut missing_secret = config("a:1", &[]);
        missing_secret.node.secret = None;
        let transport = Arc::new(network.bind(name("a:1")).await.unwrap());
        let err = GossipNode::enter(&missing_secret, transport.clone())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GossipError::Core(ref e) if e.is_fatal()));

        let err = GossipNode::enter(&config("other:1", &[]), transport)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GossipError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_bind_udp() {
        let mut config = config("127.0.0.1:0", &[]);
        config.node.bind = Some("127.0.0.1:0".to_string());
        let mut node = GossipNode::bind(&config).await.unwrap();
        assert!(node.is_running());
        assert_eq!(node.get_status().await.len(), 1);
        node.stop().await.unwrap();
        assert!(!node.is_running());
    }
}
