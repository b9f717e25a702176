//! Per-phase mapping sender→last raw packet batch (§4.2, C5).
//!
//! Deliberately tolerant of arrival-before-phase: a batch for a phase the
//! local FSM has not yet entered is still stored, and read back once the FSM
//! catches up (§9, "Future-phase inbox").

use std::collections::HashMap;

use crate::player::VerifyKey;
use crate::wire::{Batch, Phase};

#[derive(Default)]
pub struct Inbox {
    slots: HashMap<Phase, HashMap<VerifyKey, Batch>>,
}

impl Inbox {
    pub fn new() -> Self {
        let mut slots = HashMap::new();
        for phase in Phase::ALL {
            slots.insert(phase, HashMap::new());
        }
        Self { slots }
    }

    /// Records `batch` as the last packet seen from `sender` in `phase`. A
    /// later call for the same `(phase, sender)` overwrites the previous one.
    pub fn store(&mut self, phase: Phase, sender: VerifyKey, batch: Batch) {
        self.slots.entry(phase).or_default().insert(sender, batch);
    }

    pub fn get(&self, phase: Phase, sender: &VerifyKey) -> Option<&Batch> {
        self.slots.get(&phase)?.get(sender)
    }

    pub fn phase(&self, phase: Phase) -> &HashMap<VerifyKey, Batch> {
        static EMPTY: std::sync::OnceLock<HashMap<VerifyKey, Batch>> = std::sync::OnceLock::new();
        self.slots.get(&phase).unwrap_or_else(|| EMPTY.get_or_init(HashMap::new))
    }

    pub fn complete(&self, phase: Phase, expected: usize) -> bool {
        self.slots.get(&phase).map(|m| m.len()).unwrap_or(0) == expected
    }

    pub fn reset(&mut self, phase: Phase) {
        self.slots.insert(phase, HashMap::new());
    }

    pub fn reset_all(&mut self) {
        for phase in Phase::ALL {
            self.reset(phase);
        }
    }

    /// Evicts entries keyed by removed verification keys from every phase
    /// (§4.2: clearing on player-set reduction must evict removed VKs too).
    pub fn evict(&mut self, removed: &[VerifyKey]) {
        for slot in self.slots.values_mut() {
            slot.retain(|vk, _| !removed.contains(vk));
        }
    }

    /// Removes a single sender's entry from one phase's slot, used by the
    /// equivocation-failure blame resolver's duplicate-admission heuristic.
    pub fn remove(&mut self, phase: Phase, sender: &VerifyKey) {
        if let Some(slot) = self.slots.get_mut(&phase) {
            slot.remove(sender);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vk(n: u8) -> VerifyKey {
        VerifyKey(vec![n])
    }

    #[test]
    fn overwrite_and_completeness() {
        let mut inbox = Inbox::new();
        assert!(!inbox.complete(Phase::Announcement, 2));
        inbox.store(Phase::Announcement, vk(1), vec![]);
        inbox.store(Phase::Announcement, vk(2), vec![]);
        assert!(inbox.complete(Phase::Announcement, 2));
        inbox.store(Phase::Announcement, vk(1), vec![]);
        assert_eq!(inbox.phase(Phase::Announcement).len(), 2);
    }

    #[test]
    fn future_phase_storage() {
        let mut inbox = Inbox::new();
        inbox.store(Phase::Shuffling, vk(1), vec![]);
        assert!(inbox.get(Phase::Shuffling, &vk(1)).is_some());
    }

    #[test]
    fn eviction_on_player_removal() {
        let mut inbox = Inbox::new();
        inbox.store(Phase::Announcement, vk(1), vec![]);
        inbox.store(Phase::Announcement, vk(2), vec![]);
        inbox.evict(&[vk(1)]);
        assert!(inbox.get(Phase::Announcement, &vk(1)).is_none());
        assert!(inbox.get(Phase::Announcement, &vk(2)).is_some());
    }
}
