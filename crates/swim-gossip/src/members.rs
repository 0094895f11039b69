//! Membership table and clock-based conflict resolution
//!
//! Every known member lives in an index-stable arena. Entries are addressed
//! by [`MemberHandle`]s that carry the slot generation, so a handle held by a
//! shuffle stops resolving once its member is pruned and the slot reused.
//!
//! All updates, local or gossiped, are ordered by a Lamport clock: an update
//! is accepted only if its clock is strictly higher than the member's current
//! one. Locally observed transitions are stamped with [`Members::tick`], which
//! is always higher than any clock this node has seen.

use crate::listener::Listener;
use crate::packet::{EntryAck, GossipEntry};
use crate::shuffle::Resolve;
use crate::status::{Status, StatusMask};
use crate::{GossipError, Result};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use swim_core::MemberName;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Opaque member metadata, versioned by its own clock
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Metadata {
    pub clock: u64,
    pub payload: Option<Vec<u8>>,
}

/// Metadata of a member we have not heard from yet
pub const METADATA_UNKNOWN: Metadata = Metadata {
    clock: 0,
    payload: None,
};

impl Metadata {
    pub fn new(clock: u64, payload: Option<Vec<u8>>) -> Self {
        Self { clock, payload }
    }

    pub fn is_unknown(&self) -> bool {
        self.clock == 0
    }
}

impl Default for Metadata {
    fn default() -> Self {
        METADATA_UNKNOWN
    }
}

/// One known cluster member
#[derive(Debug, Clone)]
pub struct Member {
    name: MemberName,
    local: bool,
    status: Status,
    clock: u64,
    status_time: Instant,
    metadata: Metadata,
}

impl Member {
    fn new(name: MemberName, local: bool, now: Instant) -> Self {
        Self {
            name,
            local,
            status: Status::Offline,
            clock: 0,
            status_time: now,
            metadata: METADATA_UNKNOWN,
        }
    }

    pub fn name(&self) -> &MemberName {
        &self.name
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// When the status last changed, on this node's clock
    pub fn status_time(&self) -> Instant {
        self.status_time
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Whether any update has been accepted for this member yet
    pub fn is_observed(&self) -> bool {
        self.clock > 0
    }

    /// Move to `status` at `clock`.
    ///
    /// Returns `Ok(false)` without touching state when `clock` is not newer
    /// than the current one. A newer update proposing an illegal transition
    /// fails with [`GossipError::InvalidTransition`] and also leaves state
    /// unchanged. A member never observed before accepts any status.
    pub fn transition(&mut self, status: Status, clock: u64, now: Instant) -> Result<bool> {
        if clock <= self.clock {
            return Ok(false);
        }

        if self.is_observed() && !self.status.can_transition(status) {
            return Err(GossipError::InvalidTransition {
                name: self.name.clone(),
                from: self.status,
                to: status,
            });
        }

        Ok(self.accept(status, clock, now))
    }

    /// Take `status` at `clock` if the clock is newer, legal or not
    fn accept(&mut self, status: Status, clock: u64, now: Instant) -> bool {
        if clock <= self.clock {
            return false;
        }

        self.clock = clock;
        if status != self.status {
            self.status = status;
            self.status_time = now;
        }
        true
    }

    /// Take `metadata` if it is newer. Returns true if the payload changed.
    fn merge_metadata(&mut self, metadata: Metadata) -> bool {
        if metadata.clock <= self.metadata.clock {
            return false;
        }
        let changed = metadata.payload != self.metadata.payload;
        self.metadata = metadata;
        changed
    }

    pub fn to_entry(&self) -> GossipEntry {
        GossipEntry {
            name: self.name.clone(),
            clock: self.clock,
            status: self.status,
            metadata: (!self.metadata.is_unknown()).then(|| self.metadata.clone()),
        }
    }

    fn change(&self) -> MemberChange {
        MemberChange {
            name: self.name.clone(),
            status: self.status,
            clock: self.clock,
            metadata: self.metadata.clone(),
        }
    }
}

/// Notification sent when a member's status or metadata changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberChange {
    pub name: MemberName,
    pub status: Status,
    pub clock: u64,
    pub metadata: Metadata,
}

/// Stable reference to an arena slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberHandle {
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    member: Option<Member>,
}

/// Counts of members by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembersStats {
    pub total: usize,
    pub online: usize,
    pub suspect: usize,
    pub unavailable: usize,
    pub offline: usize,
    pub clock: u64,
}

/// The node's view of the cluster
pub struct Members {
    local: Member,
    slots: Vec<Slot>,
    index: HashMap<MemberName, usize>,
    free: Vec<usize>,

    /// Lamport clock of this node
    clock: u64,

    /// Highest clock each peer is known to hold, per member
    acks: HashMap<MemberName, HashMap<MemberName, u64>>,

    listener: Listener<MemberChange>,
    inserted: Vec<MemberHandle>,
    stopped: bool,
}

impl Members {
    /// Create the table with the local member online at clock 1.
    ///
    /// Seed peers are inserted unobserved; they become real members once
    /// anything about them is heard.
    pub fn new(local_name: MemberName, metadata: Vec<u8>, peers: &[MemberName]) -> Self {
        let now = Instant::now();
        let mut local = Member::new(local_name.clone(), true, now);
        local.status = Status::Online;
        local.clock = 1;
        local.metadata = Metadata::new(1, Some(metadata));

        let mut members = Self {
            local,
            slots: Vec::new(),
            index: HashMap::new(),
            free: Vec::new(),
            clock: 1,
            acks: HashMap::new(),
            listener: Listener::new(),
            inserted: Vec::new(),
            stopped: false,
        };

        for peer in peers.iter().filter(|peer| **peer != local_name) {
            members.get_or_insert(peer);
        }
        members
    }

    pub fn local(&self) -> &Member {
        &self.local
    }

    pub fn local_name(&self) -> &MemberName {
        &self.local.name
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Advance the Lamport clock for a locally originated update
    pub fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Fold a received clock into the Lamport clock
    pub fn observe(&mut self, clock: u64) {
        self.clock = self.clock.max(clock);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Number of known members, local included
    pub fn len(&self) -> usize {
        self.index.len() + 1
    }

    pub fn get(&self, name: &MemberName) -> Option<&Member> {
        if *name == self.local.name {
            return Some(&self.local);
        }
        self.index
            .get(name)
            .and_then(|&index| self.slots[index].member.as_ref())
    }

    fn get_mut(&mut self, name: &MemberName) -> Option<&mut Member> {
        let index = *self.index.get(name)?;
        self.slots[index].member.as_mut()
    }

    /// Handle of a non-local member
    pub fn handle(&self, name: &MemberName) -> Option<MemberHandle> {
        self.index.get(name).map(|&index| MemberHandle {
            index,
            generation: self.slots[index].generation,
        })
    }

    pub fn resolve(&self, handle: MemberHandle) -> Option<&Member> {
        self.slots
            .get(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.member.as_ref())
    }

    /// Look up a non-local member, inserting it unobserved if unknown.
    ///
    /// Returns `None` for the local name.
    pub fn get_or_insert(&mut self, name: &MemberName) -> Option<MemberHandle> {
        if *name == self.local.name {
            return None;
        }
        if let Some(handle) = self.handle(name) {
            return Some(handle);
        }

        let member = Member::new(name.clone(), false, Instant::now());
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index].member = Some(member);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    member: Some(member),
                });
                self.slots.len() - 1
            }
        };
        self.index.insert(name.clone(), index);

        let handle = MemberHandle {
            index,
            generation: self.slots[index].generation,
        };
        self.inserted.push(handle);
        debug!("Tracking new member {}", name);
        Some(handle)
    }

    /// Handles inserted since the last call
    pub fn take_inserted(&mut self) -> Vec<MemberHandle> {
        std::mem::take(&mut self.inserted)
    }

    /// Handles of every non-local member
    pub fn handles(&self) -> Vec<MemberHandle> {
        self.non_local()
            .filter_map(|member| self.handle(member.name()))
            .collect()
    }

    pub fn non_local(&self) -> impl Iterator<Item = &Member> {
        self.slots.iter().filter_map(|slot| slot.member.as_ref())
    }

    /// Every member, local first
    pub fn all(&self) -> impl Iterator<Item = &Member> {
        std::iter::once(&self.local).chain(self.non_local())
    }

    /// Non-local members whose status is in `mask`
    pub fn all_statuses(&self, mask: StatusMask) -> Vec<&Member> {
        self.non_local()
            .filter(|member| mask.contains(member.status()))
            .collect()
    }

    /// Random sample of up to `count` non-local members in `mask`, skipping `exclude`
    pub fn find(
        &self,
        mask: StatusMask,
        count: usize,
        exclude: &HashSet<MemberName>,
    ) -> Vec<MemberName> {
        let mut candidates: Vec<MemberName> = self
            .non_local()
            .filter(|member| mask.contains(member.status()))
            .filter(|member| !exclude.contains(member.name()))
            .map(|member| member.name().clone())
            .collect();

        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(count);
        candidates
    }

    /// Apply an update about `name`.
    ///
    /// Returns whether the update was accepted. An update whose status is not
    /// reachable from the current one fails with
    /// [`GossipError::InvalidTransition`]; remote gossip goes through
    /// [`Members::merge`] instead, which never fails.
    ///
    /// Claims about the local member are never taken: if they contradict the
    /// local entry at a clock at least as new as ours, the local entry is
    /// re-asserted at a higher clock.
    pub fn apply(
        &mut self,
        name: &MemberName,
        status: Status,
        clock: u64,
        metadata: Option<Metadata>,
    ) -> Result<bool> {
        self.update(name, status, clock, metadata, true)
    }

    fn update(
        &mut self,
        name: &MemberName,
        status: Status,
        clock: u64,
        metadata: Option<Metadata>,
        strict: bool,
    ) -> Result<bool> {
        self.observe(clock);

        if name == self.local_name() {
            self.refute(status, clock);
            return Ok(false);
        }

        let now = Instant::now();
        self.get_or_insert(name);
        let member = self
            .get_mut(name)
            .ok_or_else(|| GossipError::MemberNotFound(name.clone()))?;

        let previous = member.status();
        let accepted = if strict {
            member.transition(status, clock, now)?
        } else {
            member.accept(status, clock, now)
        };
        let metadata_changed = metadata.map_or(false, |metadata| member.merge_metadata(metadata));

        if accepted && previous != member.status() {
            info!(
                "Member {} {} -> {} (clock {})",
                name,
                previous,
                member.status(),
                clock
            );
        }

        if (accepted && previous != member.status()) || metadata_changed {
            let change = member.change();
            self.listener.notify(change);
        }

        Ok(accepted || metadata_changed)
    }

    fn refute(&mut self, status: Status, clock: u64) {
        if clock < self.local.clock {
            return;
        }
        // An echo of our own entry
        if status == self.local.status && clock == self.local.clock {
            return;
        }

        let next = self.tick();
        self.local.clock = next;

        let reasserted = self.local.status;
        if status != reasserted {
            warn!(
                "Refuting claim that local member is {} (clock {}), now {} at clock {}",
                status, clock, reasserted, next
            );
        }
    }

    /// Merge one gossip entry received from `source`.
    ///
    /// A newer clock always wins, whatever the transition: the node that
    /// issued the entry already moved through the legal steps, and taking it
    /// as is keeps merging independent of arrival order. Returns whether
    /// anything changed.
    pub fn merge(&mut self, source: &MemberName, entry: &GossipEntry) -> bool {
        self.record_ack(source, &entry.name, entry.clock);

        match self.update(
            &entry.name,
            entry.status,
            entry.clock,
            entry.metadata.clone(),
            false,
        ) {
            Ok(changed) => changed,
            Err(e) => {
                warn!("Discarding gossip about {} from {}: {}", entry.name, source, e);
                false
            }
        }
    }

    /// Record that `peer` holds `name` at `clock` or newer
    fn record_ack(&mut self, peer: &MemberName, name: &MemberName, clock: u64) {
        let known = self
            .acks
            .entry(peer.clone())
            .or_default()
            .entry(name.clone())
            .or_insert(0);
        *known = (*known).max(clock);
    }

    pub fn ack_gossip(&mut self, target: &MemberName, acks: &[EntryAck]) {
        for ack in acks {
            self.record_ack(target, &ack.name, ack.clock);
        }
    }

    /// Up to `count` entries `target` has not acknowledged, newest first
    pub fn get_gossip(&self, target: &MemberName, count: usize) -> Vec<GossipEntry> {
        let acked = self.acks.get(target);
        let mut entries: Vec<GossipEntry> = self
            .all()
            .filter(|member| member.is_observed())
            .filter(|member| {
                acked
                    .and_then(|acked| acked.get(member.name()))
                    .map_or(true, |&clock| clock < member.clock())
            })
            .map(Member::to_entry)
            .collect();

        entries.sort_by(|a, b| b.clock.cmp(&a.clock).then_with(|| a.name.cmp(&b.name)));
        entries.truncate(count);
        entries
    }

    /// Sweep timed-out members forward and prune long-offline ones.
    ///
    /// Suspect members become unavailable after `suspect_timeout`, unavailable
    /// ones go offline after `unavailable_timeout`, and offline ones are
    /// dropped after `offline_retention`. Seeds never heard from are kept.
    pub fn expire(
        &mut self,
        now: Instant,
        suspect_timeout: Duration,
        unavailable_timeout: Duration,
        offline_retention: Duration,
    ) -> usize {
        let mut advance = Vec::new();
        let mut prune = Vec::new();

        for member in self.non_local().filter(|member| member.is_observed()) {
            let elapsed = now.saturating_duration_since(member.status_time());
            match member.status() {
                Status::Suspect if elapsed >= suspect_timeout => {
                    advance.push((member.name().clone(), Status::Unavailable))
                }
                Status::Unavailable if elapsed >= unavailable_timeout => {
                    advance.push((member.name().clone(), Status::Offline))
                }
                Status::Offline if elapsed >= offline_retention => {
                    prune.push(member.name().clone())
                }
                _ => {}
            }
        }

        let mut swept = 0;
        for (name, status) in advance {
            let clock = self.tick();
            match self.apply(&name, status, clock, None) {
                Ok(true) => swept += 1,
                Ok(false) => {}
                Err(e) => warn!("Sweep of {} failed: {}", name, e),
            }
        }

        for name in prune {
            self.prune(&name);
            swept += 1;
        }
        swept
    }

    fn prune(&mut self, name: &MemberName) {
        if let Some(index) = self.index.remove(name) {
            let slot = &mut self.slots[index];
            slot.member = None;
            slot.generation += 1;
            self.free.push(index);
        }

        self.acks.remove(name);
        for acked in self.acks.values_mut() {
            acked.remove(name);
        }
        debug!("Pruned offline member {}", name);
    }

    /// Snapshot of every member's status
    pub fn get_status(&self) -> BTreeMap<MemberName, Status> {
        self.all()
            .map(|member| (member.name().clone(), member.status()))
            .collect()
    }

    /// Replace the local metadata, stamping it with a fresh clock
    pub fn set_local_metadata(&mut self, payload: Vec<u8>) -> u64 {
        let clock = self.tick();
        self.local.clock = clock;
        if self.local.merge_metadata(Metadata::new(clock, Some(payload))) {
            self.listener.notify(self.local.change());
        }
        clock
    }

    /// Mark the local member offline ahead of a graceful shutdown
    pub fn leave(&mut self) -> GossipEntry {
        if !self.stopped {
            self.stopped = true;
            let clock = self.tick();
            self.local.clock = clock;
            self.local.status = Status::Offline;
            self.local.status_time = Instant::now();
            self.listener.notify(self.local.change());
            info!("Local member {} leaving at clock {}", self.local.name, clock);
        }
        self.local.to_entry()
    }

    pub fn listener(&self) -> &Listener<MemberChange> {
        &self.listener
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MemberChange> {
        self.listener.subscribe()
    }

    pub fn stats(&self) -> MembersStats {
        let mut stats = MembersStats {
            clock: self.clock,
            ..Default::default()
        };
        for member in self.all() {
            stats.total += 1;
            match member.status() {
                Status::Online => stats.online += 1,
                Status::Suspect => stats.suspect += 1,
                Status::Unavailable => stats.unavailable += 1,
                Status::Offline => stats.offline += 1,
            }
        }
        stats
    }
}

impl Resolve<MemberHandle> for Members {
    fn is_live(&self, handle: &MemberHandle) -> bool {
        self.resolve(*handle).is_some()
    }
}
