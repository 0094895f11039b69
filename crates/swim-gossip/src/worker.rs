//! Failure detection and dissemination loops
//!
//! The worker runs three tasks over one shared [`Members`] table:
//!
//! - the packet handler, answering pings, relaying ping-reqs and merging gossip
//! - failure detection, probing one member per `ping_interval` and sweeping
//!   timed-out suspicion
//! - dissemination, pushing un-acknowledged gossip to a few available members
//!   every `sync_interval`

use crate::codec::Codec;
use crate::members::{MemberHandle, Members};
use crate::packet::{EntryAck, GossipEntry, Packet, Payload};
use crate::shuffle::WeakShuffle;
use crate::status::{Status, StatusMask};
use crate::transport::{Datagram, Transport};
use crate::Result;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use swim_core::{MemberName, ProtocolConfig};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// A ping sent on behalf of another member
#[derive(Debug)]
struct Relay {
    requester: MemberName,
    req_id: u64,
    started_at: Instant,
}

/// Drives the protocol for one node
pub struct Worker {
    config: ProtocolConfig,
    local_name: MemberName,
    members: Arc<RwLock<Members>>,
    transport: Arc<dyn Transport>,
    codec: Codec,

    /// Probes waiting for an ack, by request id
    waiting: Mutex<HashMap<u64, mpsc::Sender<()>>>,

    /// Pings sent for a ping-req, by the request id we used
    relays: Mutex<HashMap<u64, Relay>>,

    probe_targets: Mutex<WeakShuffle<MemberHandle>>,
    gossip_targets: Mutex<WeakShuffle<MemberHandle>>,
    next_req_id: AtomicU64,
}

impl Worker {
    pub fn new(
        config: ProtocolConfig,
        members: Arc<RwLock<Members>>,
        transport: Arc<dyn Transport>,
        codec: Codec,
    ) -> Self {
        let local_name = transport.local_name().clone();
        Self {
            config,
            local_name,
            members,
            transport,
            codec,
            waiting: Mutex::new(HashMap::new()),
            relays: Mutex::new(HashMap::new()),
            probe_targets: Mutex::new(WeakShuffle::new()),
            gossip_targets: Mutex::new(WeakShuffle::new()),
            next_req_id: AtomicU64::new(rand::random::<u32>() as u64),
        }
    }

    pub fn local_name(&self) -> &MemberName {
        &self.local_name
    }

    pub fn members(&self) -> &Arc<RwLock<Members>> {
        &self.members
    }

    /// Spawn the handler, failure detection and dissemination tasks
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().run_handler(shutdown.clone())),
            tokio::spawn(self.clone().run_failure_detection(shutdown.clone())),
            tokio::spawn(self.clone().run_dissemination(shutdown)),
        ]
    }

    fn next_req_id(&self) -> u64 {
        self.next_req_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register members inserted since the last call with both shuffles
    async fn sync_targets(&self) {
        let inserted = self.members.write().await.take_inserted();
        if inserted.is_empty() {
            return;
        }

        let mut probe_targets = self.probe_targets.lock().await;
        let mut gossip_targets = self.gossip_targets.lock().await;
        for handle in inserted {
            probe_targets.add(handle);
            gossip_targets.add(handle);
        }
    }

    async fn send(&self, packet: &Packet, target: &MemberName) {
        let bytes = match self.codec.encode(packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode {} for {}: {}", packet.kind(), target, e);
                return;
            }
        };

        trace!("Sending {} to {}", packet.kind(), target);
        if let Err(e) = self.transport.send_to(&bytes, target).await {
            debug!("Failed to send {} to {}: {}", packet.kind(), target, e);
        }
    }

    /// The local entry plus gossip `target` has not acknowledged
    async fn piggyback(&self, target: &MemberName) -> Vec<GossipEntry> {
        let members = self.members.read().await;
        let mut entries = vec![members.local().to_entry()];
        entries.extend(
            members
                .get_gossip(target, self.config.max_gossip_entries)
                .into_iter()
                .filter(|entry| entry.name != self.local_name),
        );
        entries
    }

    /// Build a packet around as many leading `entries` as fit in one datagram
    fn fit<F>(&self, mut entries: Vec<GossipEntry>, build: F) -> Packet
    where
        F: Fn(Vec<GossipEntry>) -> Packet,
    {
        let count = self
            .codec
            .fit_entries(&entries, self.config.max_packet_size, &build)
            .unwrap_or(0);
        entries.truncate(count);
        build(entries)
    }

    /// Probe `target`, directly and then through relays.
    ///
    /// Returns whether any ack arrived. A timeout is an ordinary outcome, not
    /// an error.
    pub async fn check(&self, target: &MemberName) -> bool {
        let (tx, mut rx) = mpsc::channel(1);

        let req_id = self.next_req_id();
        self.waiting.lock().await.insert(req_id, tx.clone());

        let gossip = self.piggyback(target).await;
        let local = self.local_name.clone();
        let ping = self.fit(gossip, |gossip| Packet::ping(local.clone(), req_id, gossip));
        self.send(&ping, target).await;

        let mut online = matches!(
            timeout(self.config.ping_timeout(), rx.recv()).await,
            Ok(Some(()))
        );

        let mut relay_req_id = None;
        if !online {
            let exclude = HashSet::from([target.clone(), self.local_name.clone()]);
            let relays = self.members.read().await.find(
                StatusMask::AVAILABLE,
                self.config.ping_req_count,
                &exclude,
            );

            if !relays.is_empty() {
                debug!(
                    "No ack from {}, asking {} members to probe it",
                    target,
                    relays.len()
                );

                // A late direct ack still lands on the same channel
                let indirect_id = self.next_req_id();
                self.waiting.lock().await.insert(indirect_id, tx);
                relay_req_id = Some(indirect_id);

                let ping_req = Packet::ping_req(local.clone(), indirect_id, target.clone());
                for relay in &relays {
                    self.send(&ping_req, relay).await;
                }

                online = matches!(
                    timeout(self.config.ping_req_timeout(), rx.recv()).await,
                    Ok(Some(()))
                );
            }
        }

        let mut waiting = self.waiting.lock().await;
        waiting.remove(&req_id);
        if let Some(id) = relay_req_id {
            waiting.remove(&id);
        }
        online
    }

    /// Probe the next member in the shuffle and record the outcome
    pub async fn probe(&self) -> Option<(MemberName, bool)> {
        self.sync_targets().await;

        let target = {
            let members = self.members.read().await;
            let mut probe_targets = self.probe_targets.lock().await;
            let handle = probe_targets.choice(&*members)?;
            members.resolve(handle)?.name().clone()
        };

        let online = self.check(&target).await;

        let mut members = self.members.write().await;
        let status = members.get(&target)?.status();
        let update = match (online, status) {
            (true, status) if status != Status::Online => Some(Status::Online),
            (false, Status::Online) => Some(Status::Suspect),
            _ => None,
        };

        if let Some(new_status) = update {
            let clock = members.tick();
            match members.apply(&target, new_status, clock, None) {
                Ok(true) if new_status == Status::Suspect => {
                    info!("Marked member {} as suspect", target)
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to record probe of {}: {}", target, e),
            }
        }
        Some((target, online))
    }

    /// Send `entries` to every target, split to fit the packet size
    pub async fn disseminate(&self, targets: &[MemberName], entries: Vec<GossipEntry>) -> Result<usize> {
        if targets.is_empty() || entries.is_empty() {
            return Ok(0);
        }

        let local = self.local_name.clone();
        let datagrams = self.codec.encode_batches(entries, self.config.max_packet_size, |entries| {
            Packet::gossip(local.clone(), entries)
        })?;

        for datagram in &datagrams {
            self.transport.broadcast(datagram, targets).await?;
        }
        Ok(datagrams.len())
    }

    /// Push un-acknowledged gossip to up to `gossip_fanout` available members
    pub async fn gossip(&self) -> usize {
        self.sync_targets().await;

        let targets: Vec<MemberName> = {
            let members = self.members.read().await;
            let mut gossip_targets = self.gossip_targets.lock().await;
            gossip_targets
                .choose(&*members, self.config.gossip_fanout, |handle| {
                    members
                        .resolve(*handle)
                        .map_or(false, |member| member.status().is_available())
                })
                .into_iter()
                .filter_map(|handle| members.resolve(handle).map(|m| m.name().clone()))
                .collect()
        };

        let mut sent = 0;
        for target in targets {
            let entries = self
                .members
                .read()
                .await
                .get_gossip(&target, self.config.max_gossip_entries);
            if entries.is_empty() {
                continue;
            }

            match self.disseminate(std::slice::from_ref(&target), entries).await {
                Ok(count) => sent += count,
                Err(e) if e.is_transient() => debug!("Gossip to {} failed: {}", target, e),
                Err(e) => warn!("Gossip to {} failed: {}", target, e),
            }
        }
        sent
    }

    /// Mark the local member offline and tell every available member
    pub async fn leave(&self) -> Result<()> {
        let (entry, targets) = {
            let mut members = self.members.write().await;
            let entry = members.leave();
            let targets: Vec<MemberName> = members
                .all_statuses(StatusMask::AVAILABLE)
                .into_iter()
                .map(|member| member.name().clone())
                .collect();
            (entry, targets)
        };

        info!("Announcing departure to {} members", targets.len());
        self.disseminate(&targets, vec![entry]).await?;
        Ok(())
    }

    /// Merge entries carried by a packet from `source`
    async fn merge_all(&self, source: &MemberName, entries: &[GossipEntry]) {
        if entries.is_empty() {
            return;
        }
        let mut members = self.members.write().await;
        for entry in entries {
            members.merge(source, entry);
        }
    }

    /// Handle one received datagram
    pub async fn handle(&self, datagram: Datagram) {
        let packet = match self.codec.decode(&datagram.bytes) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", datagram.from, e);
                return;
            }
        };

        let source = packet.source.name.clone();
        if source == self.local_name {
            return;
        }
        trace!(
            "Received {} from {} (req {:?}, {} entries)",
            packet.kind(),
            source,
            packet.req_id(),
            packet.entries().len()
        );

        let local = self.local_name.clone();
        match packet.payload {
            Payload::Ping { req_id, gossip } => {
                self.merge_all(&source, &gossip).await;
                let reply = self.piggyback(&source).await;
                let ack = self.fit(reply, |gossip| Packet::ack(local.clone(), req_id, gossip));
                self.send(&ack, &source).await;
            }
            Payload::PingReq { req_id, target } => {
                if target == self.local_name {
                    let reply = self.piggyback(&source).await;
                    let ack = self.fit(reply, |gossip| Packet::ack(local.clone(), req_id, gossip));
                    self.send(&ack, &source).await;
                    return;
                }

                let relay_id = self.next_req_id();
                self.relays.lock().await.insert(
                    relay_id,
                    Relay {
                        requester: source.clone(),
                        req_id,
                        started_at: Instant::now(),
                    },
                );

                let gossip = self.piggyback(&target).await;
                let ping = self.fit(gossip, |gossip| Packet::ping(local.clone(), relay_id, gossip));
                self.send(&ping, &target).await;
            }
            Payload::Ack { req_id, gossip } => {
                self.merge_all(&source, &gossip).await;

                if let Some(waiter) = self.waiting.lock().await.get(&req_id) {
                    let _ = waiter.try_send(());
                    return;
                }

                let relay = self.relays.lock().await.remove(&req_id);
                if let Some(relay) = relay {
                    let forward = self.fit(gossip, |gossip| {
                        Packet::ack(local.clone(), relay.req_id, gossip)
                    });
                    self.send(&forward, &relay.requester).await;
                }
            }
            Payload::Gossip { entries } => {
                self.merge_all(&source, &entries).await;
                let acks: Vec<EntryAck> = entries.iter().map(GossipEntry::ack).collect();
                self.send(&Packet::gossip_ack(local, acks), &source).await;
            }
            Payload::GossipAck { acks } => {
                self.members.write().await.ack_gossip(&source, &acks);
            }
        }
    }

    pub async fn run_handler(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        debug!("Packet handler for {} started", self.local_name);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                datagram = self.transport.recv() => match datagram {
                    Some(datagram) => self.handle(datagram).await,
                    None => {
                        debug!("Transport closed, stopping packet handler");
                        break;
                    }
                },
            }
        }
    }

    pub async fn run_failure_detection(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.ping_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                _ = ticker.tick() => {
                    self.sweep().await;

                    let worker = self.clone();
                    in_flight.spawn(async move {
                        if let Some((target, false)) = worker.probe().await {
                            debug!("Probe of {} failed", target);
                        }
                    });
                }
            }
        }

        // In-flight probes are abandoned
        in_flight.abort_all();
    }

    /// Advance timed-out members and forget stale relays
    async fn sweep(&self) {
        let swept = self.members.write().await.expire(
            Instant::now(),
            self.config.suspect_timeout(),
            self.config.unavailable_timeout(),
            self.config.offline_retention(),
        );
        if swept > 0 {
            debug!("Swept {} members", swept);

            let members = self.members.read().await;
            let stale = self.probe_targets.lock().await.prune(&*members);
            self.gossip_targets.lock().await.prune(&*members);
            if stale > 0 {
                trace!("Dropped {} pruned members from the target shuffles", stale);
            }
        }

        let relay_ttl = self.config.ping_timeout() + self.config.ping_req_timeout();
        self.relays
            .lock()
            .await
            .retain(|_, relay| relay.started_at.elapsed() < relay_ttl);
    }

    pub async fn run_dissemination(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.sync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    self.gossip().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use std::time::Duration;

    const SECRET: &str = "cluster-secret";

    struct TestNode {
        worker: Arc<Worker>,
        _shutdown: watch::Sender<bool>,
    }

    fn name(s: &str) -> MemberName {
        MemberName::new(s)
    }

    /// A worker with only its packet handler running
    async fn node(network: &MemoryNetwork, local: &str, peers: &[&str]) -> TestNode {
        let local = name(local);
        let peers: Vec<MemberName> = peers.iter().map(|p| name(p)).collect();
        let members = Arc::new(RwLock::new(Members::new(local.clone(), Vec::new(), &peers)));
        let transport = Arc::new(network.bind(local).await.unwrap());
        let worker = Arc::new(Worker::new(
            ProtocolConfig::default(),
            members,
            transport,
            Codec::with_secret(SECRET).unwrap(),
        ));

        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(worker.clone().run_handler(rx));
        TestNode {
            worker,
            _shutdown: shutdown,
        }
    }

    async fn status_of(node: &TestNode, member: &str) -> Option<Status> {
        node.worker
            .members()
            .read()
            .await
            .get(&name(member))
            .map(|m| m.status())
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_direct_ack() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a:1", &["b:1"]).await;
        let b = node(&network, "b:1", &[]).await;

        assert!(a.worker.check(&name("b:1")).await);
        // The ack carried b's local entry, the ping carried a's
        assert_eq!(status_of(&a, "b:1").await, Some(Status::Online));
        assert_eq!(status_of(&b, "a:1").await, Some(Status::Online));
        assert!(a.worker.waiting.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_through_relay() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a:1", &["b:1", "c:1"]).await;
        let _b = node(&network, "b:1", &[]).await;
        let _c = node(&network, "c:1", &[]).await;

        // a learns c is available first
        assert!(a.worker.check(&name("c:1")).await);

        network.partition(&name("a:1"), &name("b:1")).await;
        let started = Instant::now();
        assert!(a.worker.check(&name("b:1")).await);
        assert!(started.elapsed() >= a.worker.config.ping_timeout());
        assert!(a.worker.relays.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_times_out() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a:1", &["b:1", "c:1"]).await;
        let _b = node(&network, "b:1", &[]).await;
        let _c = node(&network, "c:1", &[]).await;
        assert!(a.worker.check(&name("c:1")).await);

        network.isolate(&name("b:1")).await;
        let started = Instant::now();
        assert!(!a.worker.check(&name("b:1")).await);

        let config = &a.worker.config;
        assert!(started.elapsed() >= config.ping_timeout() + config.ping_req_timeout());
        assert!(a.worker.waiting.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspicion_and_recovery() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a:1", &["b:1", "c:1", "d:1"]).await;
        let b = node(&network, "b:1", &[]).await;
        let _c = node(&network, "c:1", &[]).await;
        let _d = node(&network, "d:1", &[]).await;

        for peer in ["b:1", "c:1", "d:1"] {
            assert!(a.worker.check(&name(peer)).await);
        }
        let before = a.worker.members().read().await.get(&name("b:1")).unwrap().clock();

        // Both relays are up but b is cut off from everyone
        network.isolate(&name("b:1")).await;
        let mut suspected = false;
        for _ in 0..3 {
            if let Some((target, false)) = a.worker.probe().await {
                assert_eq!(target, name("b:1"));
                suspected = true;
            }
        }
        assert!(suspected);

        let (status, clock) = {
            let members = a.worker.members().read().await;
            let member = members.get(&name("b:1")).unwrap();
            (member.status(), member.clock())
        };
        assert_eq!(status, Status::Suspect);
        assert!(clock > before);

        // b comes back claiming online at a higher clock
        network.heal_all().await;
        let refuted = {
            let mut members = b.worker.members().write().await;
            members.apply(&name("b:1"), Status::Suspect, clock, None).unwrap();
            members.local().clock()
        };
        assert!(refuted > clock);
        assert!(b.worker.check(&name("a:1")).await);
        assert_eq!(status_of(&a, "b:1").await, Some(Status::Online));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forged_packets_dropped() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a:1", &[]).await;
        let forger = network.bind(name("evil:1")).await.unwrap();

        let forged = Codec::with_secret("wrong-secret")
            .unwrap()
            .encode(&Packet::gossip(
                name("evil:1"),
                vec![GossipEntry {
                    name: name("a:1"),
                    clock: 100,
                    status: Status::Offline,
                    metadata: None,
                }],
            ))
            .unwrap();
        forger.send_to(&forged, &name("a:1")).await.unwrap();
        forger.send_to(b"garbage", &name("a:1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let members = a.worker.members().read().await;
        assert!(members.get(&name("evil:1")).is_none());
        assert_eq!(members.local().clock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gossip_push_and_ack() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a:1", &["b:1"]).await;
        let b = node(&network, "b:1", &[]).await;
        assert!(a.worker.check(&name("b:1")).await);

        a.worker
            .members()
            .write()
            .await
            .apply(&name("c:1"), Status::Online, 10, None)
            .unwrap();

        assert!(a.worker.gossip().await > 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(status_of(&b, "c:1").await, Some(Status::Online));

        // Everything b confirmed is not sent again
        let pending = a.worker.members().read().await.get_gossip(&name("b:1"), 16);
        assert!(pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_prunes_target_shuffles() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a:1", &["b:1"]).await;
        {
            let mut members = a.worker.members().write().await;
            members.apply(&name("c:1"), Status::Online, 2, None).unwrap();
            members.apply(&name("c:1"), Status::Offline, 3, None).unwrap();
        }
        a.worker.sync_targets().await;
        assert_eq!(a.worker.probe_targets.lock().await.len(), 2);

        tokio::time::advance(ProtocolConfig::default().offline_retention() + Duration::from_secs(1))
            .await;
        a.worker.sweep().await;

        assert_eq!(status_of(&a, "c:1").await, None);
        assert_eq!(a.worker.probe_targets.lock().await.len(), 1);
        assert_eq!(a.worker.gossip_targets.lock().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_announced() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a:1", &["b:1"]).await;
        let b = node(&network, "b:1", &[]).await;
        assert!(a.worker.check(&name("b:1")).await);
        let mut changes = b.worker.members().read().await.subscribe();

        a.worker.leave().await.unwrap();
        let change = tokio::time::timeout(Duration::from_secs(1), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.name, name("a:1"));
        assert_eq!(change.status, Status::Offline);
    }
}
