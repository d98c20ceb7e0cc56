//! Status enums and their combinators.
//!
//! Both [`Status::add`] and [`Provisioned::and`] are joins over a small
//! lattice, so folding a set of values gives the same result whatever the
//! iteration order.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Availability / overall status of an instance or object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Status {
    #[default]
    #[serde(rename = "undef")]
    Undef,
    #[serde(rename = "n/a")]
    NotApplicable,
    #[serde(rename = "up")]
    Up,
    #[serde(rename = "down")]
    Down,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "stdby up")]
    StandbyUp,
    #[serde(rename = "stdby down")]
    StandbyDown,
}

impl Status {
    /// True if self is one of `candidates`
    pub fn is(&self, candidates: &[Status]) -> bool {
        candidates.contains(self)
    }

    /// Standby states count as their non-standby counterpart when combined
    fn normalized(self) -> Self {
        match self {
            Self::StandbyUp => Self::Up,
            Self::StandbyDown => Self::Down,
            other => other,
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::Undef => 0,
            Self::NotApplicable => 1,
            Self::Up | Self::Down | Self::StandbyUp | Self::StandbyDown => 2,
            Self::Warn => 3,
        }
    }

    /// Combine two statuses.
    ///
    /// `undef` < `n/a` < {`up`, `down`} < `warn`; `up` joined with `down` is `warn`.
    pub fn add(self, other: Status) -> Status {
        let (a, b) = (self.normalized(), other.normalized());
        if a == b {
            return a;
        }
        match a.rank().cmp(&b.rank()) {
            std::cmp::Ordering::Greater => a,
            std::cmp::Ordering::Less => b,
            // same rank, different values: only up vs down remains
            std::cmp::Ordering::Equal => Status::Warn,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Undef => "undef",
            Self::NotApplicable => "n/a",
            Self::Up => "up",
            Self::Down => "down",
            Self::Warn => "warn",
            Self::StandbyUp => "stdby up",
            Self::StandbyDown => "stdby down",
        };
        f.write_str(s)
    }
}

/// Provisioned tri-state (plus undef and n/a)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provisioned {
    #[default]
    Undef,
    #[serde(rename = "n/a")]
    NotApplicable,
    True,
    False,
    Mixed,
}

impl Provisioned {
    fn rank(self) -> u8 {
        match self {
            Self::Undef => 0,
            Self::NotApplicable => 1,
            Self::True | Self::False => 2,
            Self::Mixed => 3,
        }
    }

    /// Logical AND of two provisioned states; disagreeing booleans give `mixed`
    pub fn and(self, other: Provisioned) -> Provisioned {
        if self == other {
            return self;
        }
        match self.rank().cmp(&other.rank()) {
            std::cmp::Ordering::Greater => self,
            std::cmp::Ordering::Less => other,
            std::cmp::Ordering::Equal => Provisioned::Mixed,
        }
    }
}

/// Placement quality of an object across its nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Placement {
    #[default]
    #[serde(rename = "n/a")]
    NotApplicable,
    #[serde(rename = "optimal")]
    Optimal,
    #[serde(rename = "non-optimal")]
    NonOptimal,
}

/// Aggregated frozen state of an object across its nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Frozen {
    #[default]
    #[serde(rename = "n/a")]
    NotApplicable,
    #[serde(rename = "frozen")]
    Frozen,
    #[serde(rename = "thawed")]
    Thawed,
    #[serde(rename = "mixed")]
    Mixed,
}

impl fmt::Display for Frozen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotApplicable => "n/a",
            Self::Frozen => "frozen",
            Self::Thawed => "thawed",
            Self::Mixed => "mixed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Status; 7] = [
        Status::Undef,
        Status::NotApplicable,
        Status::Up,
        Status::Down,
        Status::Warn,
        Status::StandbyUp,
        Status::StandbyDown,
    ];

    #[test]
    fn test_status_add_table() {
        assert_eq!(Status::Undef.add(Status::Up), Status::Up);
        assert_eq!(Status::NotApplicable.add(Status::Down), Status::Down);
        assert_eq!(Status::Up.add(Status::Up), Status::Up);
        assert_eq!(Status::Up.add(Status::Down), Status::Warn);
        assert_eq!(Status::Warn.add(Status::Up), Status::Warn);
        assert_eq!(Status::StandbyUp.add(Status::Up), Status::Up);
        assert_eq!(Status::Undef.add(Status::NotApplicable), Status::NotApplicable);
    }

    #[test]
    fn test_status_add_is_order_independent() {
        for a in ALL {
            for b in ALL {
                assert_eq!(a.add(b), b.add(a), "{a} + {b}");
                for c in ALL {
                    assert_eq!(a.add(b).add(c), a.add(b.add(c)), "{a} + {b} + {c}");
                }
            }
        }
    }

    #[test]
    fn test_provisioned_and() {
        assert_eq!(Provisioned::Undef.and(Provisioned::True), Provisioned::True);
        assert_eq!(Provisioned::True.and(Provisioned::True), Provisioned::True);
        assert_eq!(Provisioned::True.and(Provisioned::False), Provisioned::Mixed);
        assert_eq!(Provisioned::NotApplicable.and(Provisioned::False), Provisioned::False);
        assert_eq!(Provisioned::Mixed.and(Provisioned::True), Provisioned::Mixed);
    }

    #[test]
    fn test_status_serde_names() {
        assert_eq!(serde_json::to_string(&Status::NotApplicable).unwrap(), "\"n/a\"");
        assert_eq!(serde_json::to_string(&Status::StandbyUp).unwrap(), "\"stdby up\"");
        let p: Placement = serde_json::from_str("\"non-optimal\"").unwrap();
        assert_eq!(p, Placement::NonOptimal);
    }
}
