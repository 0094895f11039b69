//! Member status state machine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Liveness status of a cluster member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Member is responding to probes
    Online,
    /// Member missed a probe and is waiting to be refuted
    Suspect,
    /// Member stayed suspect for longer than the suspicion timeout
    Unavailable,
    /// Member left the cluster or was given up on
    Offline,
}

impl Status {
    /// Every status, in table order
    pub const ALL: [Status; 4] = [
        Status::Online,
        Status::Suspect,
        Status::Unavailable,
        Status::Offline,
    ];

    /// The single-status mask for this status
    pub const fn mask(self) -> StatusMask {
        match self {
            Status::Online => StatusMask::ONLINE,
            Status::Suspect => StatusMask::SUSPECT,
            Status::Unavailable => StatusMask::UNAVAILABLE,
            Status::Offline => StatusMask::OFFLINE,
        }
    }

    /// Statuses reachable from this one by an accepted (higher clock) update.
    ///
    /// A member leaves `Offline` only by rejoining as `Online`.
    pub const fn allowed_transitions(self) -> StatusMask {
        match self {
            Status::Online => StatusMask::SUSPECT.union(StatusMask::OFFLINE),
            Status::Suspect => StatusMask::ONLINE
                .union(StatusMask::UNAVAILABLE)
                .union(StatusMask::OFFLINE),
            Status::Unavailable => StatusMask::ONLINE.union(StatusMask::OFFLINE),
            Status::Offline => StatusMask::ONLINE,
        }
    }

    /// Whether a member in this status may move to `to`.
    ///
    /// Re-asserting the current status is always legal; it only refreshes the
    /// clock.
    pub fn can_transition(self, to: Status) -> bool {
        self == to || self.allowed_transitions().contains(to)
    }

    /// Check if the member is considered reachable (online or suspect)
    pub fn is_available(self) -> bool {
        StatusMask::AVAILABLE.contains(self)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Online => write!(f, "online"),
            Status::Suspect => write!(f, "suspect"),
            Status::Unavailable => write!(f, "unavailable"),
            Status::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "online" => Ok(Status::Online),
            "suspect" => Ok(Status::Suspect),
            "unavailable" => Ok(Status::Unavailable),
            "offline" => Ok(Status::Offline),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// A set of statuses, used to select members and to encode the transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StatusMask(u8);

impl StatusMask {
    pub const EMPTY: StatusMask = StatusMask(0);
    pub const ONLINE: StatusMask = StatusMask(1 << 0);
    pub const SUSPECT: StatusMask = StatusMask(1 << 1);
    pub const UNAVAILABLE: StatusMask = StatusMask(1 << 2);
    pub const OFFLINE: StatusMask = StatusMask(1 << 3);

    /// Members considered reachable
    pub const AVAILABLE: StatusMask = StatusMask::ONLINE.union(StatusMask::SUSPECT);

    /// Every status
    pub const ALL: StatusMask = StatusMask::AVAILABLE
        .union(StatusMask::UNAVAILABLE)
        .union(StatusMask::OFFLINE);

    pub const fn union(self, other: StatusMask) -> StatusMask {
        StatusMask(self.0 | other.0)
    }

    pub fn contains(self, status: Status) -> bool {
        self.0 & status.mask().0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The statuses in this set, in table order
    pub fn iter(self) -> impl Iterator<Item = Status> {
        Status::ALL.into_iter().filter(move |status| self.contains(*status))
    }
}

impl BitOr for StatusMask {
    type Output = StatusMask;

    fn bitor(self, rhs: StatusMask) -> StatusMask {
        self.union(rhs)
    }
}

impl From<Status> for StatusMask {
    fn from(status: Status) -> Self {
        status.mask()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use Status::*;
        let legal = [
            (Online, Suspect),
            (Online, Offline),
            (Suspect, Online),
            (Suspect, Unavailable),
            (Suspect, Offline),
            (Unavailable, Online),
            (Unavailable, Offline),
            (Offline, Online),
        ];

        for from in Status::ALL {
            for to in Status::ALL {
                let expected = from == to || legal.contains(&(from, to));
                assert_eq!(
                    from.can_transition(to),
                    expected,
                    "{} -> {} legality",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_masks() {
        assert!(StatusMask::AVAILABLE.contains(Status::Online));
        assert!(StatusMask::AVAILABLE.contains(Status::Suspect));
        assert!(!StatusMask::AVAILABLE.contains(Status::Unavailable));
        assert!(!StatusMask::AVAILABLE.contains(Status::Offline));

        assert_eq!(StatusMask::ALL.iter().count(), 4);
        assert!(StatusMask::EMPTY.is_empty());
        assert_eq!(
            StatusMask::ONLINE | StatusMask::SUSPECT,
            StatusMask::AVAILABLE
        );
        assert_eq!(StatusMask::from(Status::Offline), StatusMask::OFFLINE);
        assert_eq!(
            StatusMask::AVAILABLE.iter().collect::<Vec<_>>(),
            vec![Status::Online, Status::Suspect]
        );
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("ONLINE".parse::<Status>(), Ok(Status::Online));
        assert_eq!("unavailable".parse::<Status>(), Ok(Status::Unavailable));
        assert!("dead".parse::<Status>().is_err());
        assert_eq!(Status::Suspect.to_string(), "suspect");
    }
}
