//! Capability tokens gating side-effecting operations
//!
//! A [`Capability`] is a named permission declared at program-definition time
//! and optionally narrowed per invocation. The effective set for an
//! invocation is always the intersection of the declared set and the
//! requested override; admission control ([`crate::error::ErrorKind::Capability`])
//! rejects any operation whose capability is outside the effective set.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, str::FromStr};

use crate::error::ProgramError;

/// The closed set of permission tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Move,
    Look,
    Dig,
    Place,
    Attack,
    Inventory,
    Craft,
    Pathfind,
    Events,
    Time,
    Screenshot,
}

impl Capability {
    pub const ALL: [Capability; 11] = [
        Capability::Move,
        Capability::Look,
        Capability::Dig,
        Capability::Place,
        Capability::Attack,
        Capability::Inventory,
        Capability::Craft,
        Capability::Pathfind,
        Capability::Events,
        Capability::Time,
        Capability::Screenshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Move => "move",
            Capability::Look => "look",
            Capability::Dig => "dig",
            Capability::Place => "place",
            Capability::Attack => "attack",
            Capability::Inventory => "inventory",
            Capability::Craft => "craft",
            Capability::Pathfind => "pathfind",
            Capability::Events => "events",
            Capability::Time => "time",
            Capability::Screenshot => "screenshot",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = ProgramError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| ProgramError::invalid_argument(format!("unknown capability: {s}")))
    }
}

/// An ordered set of capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self(Capability::ALL.into_iter().collect())
    }

    /// Parses a list of capability names, rejecting unknown tokens.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self, ProgramError> {
        let mut set = BTreeSet::new();
        for name in names {
            set.insert(name.as_ref().parse::<Capability>()?);
        }
        Ok(Self(set))
    }

    pub fn insert(&mut self, cap: Capability) {
        self.0.insert(cap);
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }

    pub fn contains_any(&self, caps: &[Capability]) -> bool {
        caps.iter().any(|c| self.0.contains(c))
    }

    /// The effective set of an invocation: declared ∩ requested.
    pub fn intersect(&self, other: &CapabilitySet) -> CapabilitySet {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.0.iter().map(|c| c.as_str()).collect()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_unknown_tokens() {
        assert!(CapabilitySet::parse(&["move", "dig"]).is_ok());
        assert!(CapabilitySet::parse(&["move", "fly"]).is_err());
    }

    #[test]
    fn serializes_as_lowercase_names() {
        let set = CapabilitySet::parse(&["dig", "move"]).unwrap();
        let s = serde_json::to_string(&set).unwrap();
        assert_eq!(s, r#"["move","dig"]"#);
    }

    #[test]
    fn intersect_is_the_effective_set() {
        let declared = CapabilitySet::parse(&["move", "dig", "craft"]).unwrap();
        let requested = CapabilitySet::parse(&["dig", "events"]).unwrap();
        let effective = declared.intersect(&requested);
        assert!(effective.contains(Capability::Dig));
        assert!(!effective.contains(Capability::Move));
        assert!(!effective.contains(Capability::Events));
        assert_eq!(effective.len(), 1);
    }
}
