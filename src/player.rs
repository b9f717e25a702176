use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::LocalFault;

/// Verification key: a peer's public signature key, carried on the wire as
/// an opaque byte string (§3, "Local identity").
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct VerifyKey(pub Vec<u8>);

impl VerifyKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for VerifyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Ordered mapping from positional index to verification key (§3, "Player
/// set P"). Positions are stable: ordering is the ascending sort of indices.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PlayerSet(BTreeMap<u16, VerifyKey>);

impl PlayerSet {
    pub fn new(players: BTreeMap<u16, VerifyKey>) -> Self {
        Self(players)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains_key(&self, vk: &VerifyKey) -> bool {
        self.0.values().any(|v| v == vk)
    }

    pub fn get(&self, index: u16) -> Option<&VerifyKey> {
        self.0.get(&index)
    }

    /// All distinct verification keys currently seated, regardless of
    /// position, lowest index first.
    pub fn values(&self) -> impl Iterator<Item = &VerifyKey> {
        self.0.values()
    }

    pub fn indices(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.keys().copied()
    }

    /// Lowest seated index.
    pub fn first(&self) -> u16 {
        *self.0.keys().next().expect("player set is never empty here")
    }

    /// Highest seated index.
    pub fn last(&self) -> u16 {
        *self.0.keys().next_back().expect("player set is never empty here")
    }

    pub fn next(&self, index: u16) -> Option<u16> {
        self.0.keys().copied().find(|&i| i > index)
    }

    pub fn previous(&self, index: u16) -> Option<u16> {
        self.0.keys().copied().rev().find(|&i| i < index)
    }

    /// Indices from `self.last()` down to (and excluding) `from`, used to
    /// order onion-layer encryption keys from outermost to innermost.
    pub fn from_last_down_to(&self, from: u16) -> Vec<u16> {
        self.0
            .keys()
            .copied()
            .filter(|&i| i > from)
            .rev()
            .collect()
    }

    /// Index owning `vk`, if seated.
    pub fn index_of(&self, vk: &VerifyKey) -> Option<u16> {
        self.0.iter().find(|(_, v)| *v == vk).map(|(i, _)| *i)
    }

    /// Removes every player whose key is in `removed`, returning the
    /// surviving set. Used by blame resolution to shrink P.
    pub fn without(&self, removed: &[VerifyKey]) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(_, vk)| !removed.contains(vk))
                .map(|(i, vk)| (*i, vk.clone()))
                .collect(),
        )
    }

    pub fn validate(&self) -> Result<(), LocalFault> {
        let distinct: std::collections::HashSet<_> = self.0.values().collect();
        if distinct.len() != self.0.len() {
            return Err(LocalFault::DuplicatePlayers);
        }
        Ok(())
    }
}

/// Local signing identity: signing key, verification key, and derived
/// position `me` within the player set (§3, "Local identity").
pub struct Identity<SK> {
    pub signing_key: SK,
    pub verify_key: VerifyKey,
    pub me: u16,
}

impl<SK> Identity<SK> {
    pub fn locate(signing_key: SK, verify_key: VerifyKey, players: &PlayerSet) -> Result<Self, LocalFault> {
        players.validate()?;
        let me = players
            .index_of(&verify_key)
            .ok_or(LocalFault::NotInPlayerSet)?;
        Ok(Self {
            signing_key,
            verify_key,
            me,
        })
    }
}
