//! EquivocationCheck phase (§4.4.6) and the shared transcript hash (§4.4.8)
//! used both here and when raising a mid-shuffle ShuffleFailure blame.

use serde::{Deserialize, Serialize};

use crate::channels::Channels;
use crate::coin::CoinAdapter;
use crate::crypto::hash_parts;
use crate::error::RoundError;
use crate::player::VerifyKey;
use crate::wire::{Batch, BlameReason, Message, Phase};

use super::Round;

/// Evidence attached to an EquivocationFailure blame: the accuser's own
/// Announcement and BroadcastOutput inbox contents, opaque to everyone but
/// the blame resolver (§4.5, "Blame evidence format").
#[derive(Serialize, Deserialize)]
pub(super) struct EquivocationEvidence {
    pub(super) phase1: Vec<(VerifyKey, Batch)>,
    pub(super) phase3: Vec<(VerifyKey, Batch)>,
}

impl<'a, CH: Channels, CO: CoinAdapter> Round<'a, CH, CO> {
    fn canonical_ek_blob(&self) -> Vec<u8> {
        let ordered: Vec<Vec<u8>> = self
            .players
            .indices()
            .map(|i| {
                let vk = self.players.get(i).expect("seated index");
                self.encryption_keys.get(vk).cloned().unwrap_or_default()
            })
            .collect();
        bincode::serialize(&ordered).expect("in-memory vec always serializes")
    }

    fn canonical_output_blob(&self) -> Vec<u8> {
        let ordered: Vec<String> = self.new_addresses.iter().cloned().collect();
        bincode::serialize(&ordered).expect("in-memory vec always serializes")
    }

    /// `Hash(repr([EK[P[i]] for i in sorted(P)]))` (§4.4.8): computed by an
    /// accuser initiating a ShuffleFailure blame, before O is known.
    pub(super) fn transcript_hash(&self) -> Vec<u8> {
        hash_parts(&[&self.canonical_ek_blob()])
    }

    /// `Hash(repr(O) || repr([EK[P[i]] for i in sorted(P)]))` (§4.4.6).
    fn equivocation_hash(&self) -> Vec<u8> {
        hash_parts(&[&self.canonical_output_blob(), &self.canonical_ek_blob()])
    }

    fn collect_equivocation_evidence(&self) -> Vec<u8> {
        let phase1 = self
            .inbox
            .phase(Phase::Announcement)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let phase3 = self
            .inbox
            .phase(Phase::BroadcastOutput)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        bincode::serialize(&EquivocationEvidence { phase1, phase3 }).expect("in-memory struct always serializes")
    }

    pub(super) fn enter_equivocation_check(&mut self) -> Result<(), RoundError> {
        self.phase = Phase::EquivocationCheck;
        let h = self.equivocation_hash();
        self.send_one(Phase::EquivocationCheck, None, Message::Hash(h))
    }

    pub(super) fn process_equivocation_check(&mut self) -> Result<(), RoundError> {
        if !self.inbox.complete(Phase::EquivocationCheck, self.players.len()) {
            return Ok(());
        }
        let local = self.equivocation_hash();
        let entries: Vec<_> = self
            .inbox
            .phase(Phase::EquivocationCheck)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (sender, batch) in entries {
            for envelope in batch {
                if let Message::Hash(h) = envelope.message {
                    if h != local {
                        let idx = self.players.index_of(&sender);
                        let evidence = self.collect_equivocation_evidence();
                        self.send_blame(BlameReason::EquivocationFailure, sender, None, Some(evidence))?;
                        self.log_error(format!("equivocation-check hash mismatch from player {idx:?}"));
                        return Ok(());
                    }
                }
            }
        }
        self.log("equivocation check agrees across all players, moving to VerificationAndSubmission");
        self.enter_verification_and_submission()
    }
}
