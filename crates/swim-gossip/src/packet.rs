//! Wire message types exchanged between members

use crate::members::Metadata;
use crate::status::Status;
use serde::{Deserialize, Serialize};
use std::fmt;
use swim_core::MemberName;

/// Sender of a packet, used to route replies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub name: MemberName,
}

impl Source {
    pub fn new(name: MemberName) -> Self {
        Self { name }
    }
}

/// One member's state as carried in gossip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipEntry {
    pub name: MemberName,
    pub clock: u64,
    pub status: Status,

    /// Omitted when the sender has not received the member's metadata yet
    pub metadata: Option<Metadata>,
}

impl GossipEntry {
    pub fn ack(&self) -> EntryAck {
        EntryAck {
            name: self.name.clone(),
            clock: self.clock,
        }
    }
}

/// Confirms receipt of one gossip entry at a given clock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryAck {
    pub name: MemberName,
    pub clock: u64,
}

/// Payload variants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Direct liveness probe, with piggy-backed gossip
    Ping { req_id: u64, gossip: Vec<GossipEntry> },

    /// Ask the receiver to probe `target` on the sender's behalf
    PingReq { req_id: u64, target: MemberName },

    /// Reply to a ping, correlated by `req_id`
    Ack { req_id: u64, gossip: Vec<GossipEntry> },

    /// Unsolicited push of membership deltas
    Gossip { entries: Vec<GossipEntry> },

    /// Receipt of gossip entries
    GossipAck { acks: Vec<EntryAck> },
}

/// Kind of a packet, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Ping,
    PingReq,
    Ack,
    Gossip,
    GossipAck,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketKind::Ping => write!(f, "ping"),
            PacketKind::PingReq => write!(f, "ping-req"),
            PacketKind::Ack => write!(f, "ack"),
            PacketKind::Gossip => write!(f, "gossip"),
            PacketKind::GossipAck => write!(f, "gossip-ack"),
        }
    }
}

/// A protocol packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub source: Source,
    pub payload: Payload,
}

impl Packet {
    pub fn new(source: MemberName, payload: Payload) -> Self {
        Self {
            source: Source::new(source),
            payload,
        }
    }

    pub fn ping(source: MemberName, req_id: u64, gossip: Vec<GossipEntry>) -> Self {
        Self::new(source, Payload::Ping { req_id, gossip })
    }

    pub fn ping_req(source: MemberName, req_id: u64, target: MemberName) -> Self {
        Self::new(source, Payload::PingReq { req_id, target })
    }

    pub fn ack(source: MemberName, req_id: u64, gossip: Vec<GossipEntry>) -> Self {
        Self::new(source, Payload::Ack { req_id, gossip })
    }

    pub fn gossip(source: MemberName, entries: Vec<GossipEntry>) -> Self {
        Self::new(source, Payload::Gossip { entries })
    }

    pub fn gossip_ack(source: MemberName, acks: Vec<EntryAck>) -> Self {
        Self::new(source, Payload::GossipAck { acks })
    }

    pub fn kind(&self) -> PacketKind {
        match self.payload {
            Payload::Ping { .. } => PacketKind::Ping,
            Payload::PingReq { .. } => PacketKind::PingReq,
            Payload::Ack { .. } => PacketKind::Ack,
            Payload::Gossip { .. } => PacketKind::Gossip,
            Payload::GossipAck { .. } => PacketKind::GossipAck,
        }
    }

    /// Request correlation id, for the variants that carry one
    pub fn req_id(&self) -> Option<u64> {
        match self.payload {
            Payload::Ping { req_id, .. }
            | Payload::PingReq { req_id, .. }
            | Payload::Ack { req_id, .. } => Some(req_id),
            Payload::Gossip { .. } | Payload::GossipAck { .. } => None,
        }
    }

    /// Gossip entries carried by this packet, piggy-backed or pushed
    pub fn entries(&self) -> &[GossipEntry] {
        match &self.payload {
            Payload::Ping { gossip, .. } | Payload::Ack { gossip, .. } => gossip,
            Payload::Gossip { entries } => entries,
            Payload::PingReq { .. } | Payload::GossipAck { .. } => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, clock: u64, status: Status) -> GossipEntry {
        GossipEntry {
            name: MemberName::new(name),
            clock,
            status,
            metadata: None,
        }
    }

    #[test]
    fn test_packet_constructors() {
        let source = MemberName::new("10.0.0.1:7946");
        let target = MemberName::new("10.0.0.2:7946");

        let ping = Packet::ping(source.clone(), 7, vec![entry("10.0.0.1:7946", 3, Status::Online)]);
        assert_eq!(ping.kind(), PacketKind::Ping);
        assert_eq!(ping.source.name, source);
        assert_eq!(ping.req_id(), Some(7));
        assert_eq!(ping.entries().len(), 1);

        let req = Packet::ping_req(source.clone(), 8, target.clone());
        assert_eq!(req.kind(), PacketKind::PingReq);
        assert!(matches!(req.payload, Payload::PingReq { ref target, .. } if target.as_str() == "10.0.0.2:7946"));
        assert!(req.entries().is_empty());

        let gossip = Packet::gossip(source.clone(), vec![entry("10.0.0.3:7946", 4, Status::Suspect)]);
        assert_eq!(gossip.req_id(), None);
        assert_eq!(gossip.entries()[0].status, Status::Suspect);

        let acks = gossip.entries().iter().map(GossipEntry::ack).collect();
        let gossip_ack = Packet::gossip_ack(target, acks);
        assert_eq!(gossip_ack.kind(), PacketKind::GossipAck);
        assert!(matches!(
            gossip_ack.payload,
            Payload::GossipAck { ref acks } if acks[0].clock == 4
        ));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(PacketKind::PingReq.to_string(), "ping-req");
        assert_eq!(PacketKind::GossipAck.to_string(), "gossip-ack");
    }
}
