//! Blame resolver (§4.5, C7): the four sub-protocols that replay prior
//! phases and attribute misconduct. Entering `Blame` suspends normal phase
//! advancement (§4.4.1) — `process_inbox` routes here whenever the local
//! Blame inbox slot is non-empty, regardless of `self.phase`.
//!
//! Players converge on a reason by majority of non-[`BlameReason::Liar`]
//! reports (§4.5, "all players agree on the reason of the first blame
//! message observed"). A `Liar` report is a verdict broadcast by
//! [`super::Round::ban_the_liar`] once a player has locally resolved the
//! round, not a fresh accusation, so it never counts toward reason
//! convergence; it only confirms the `accused` it names.

use std::collections::{BTreeMap, BTreeSet};

use crate::channels::Channels;
use crate::coin::CoinAdapter;
use crate::crypto::EphemeralKeyPair;
use crate::error::{BlameException, LocalFault, RoundError};
use crate::player::VerifyKey;
use crate::wire::{Batch, BlameReason, KeyPayload, Message, Phase};

use super::equivocation::EquivocationEvidence;
use super::Round;

/// One sender's current Blame message, unpacked from its inbox slot.
struct BlameReport {
    sender: VerifyKey,
    reason: BlameReason,
    accused: VerifyKey,
    inner_key: Option<KeyPayload>,
    invalid_packets: Option<Vec<u8>>,
}

impl<'a, CH: Channels, CO: CoinAdapter> Round<'a, CH, CO> {
    fn collect_blame_reports(&self) -> Vec<BlameReport> {
        let mut reports = Vec::new();
        for batch in self.inbox.phase(Phase::Blame).values() {
            for envelope in batch {
                if let Message::Blame {
                    reason,
                    accused,
                    inner_key,
                    invalid_packets,
                } = &envelope.message
                {
                    reports.push(BlameReport {
                        sender: envelope.from_key.clone(),
                        reason: *reason,
                        accused: accused.clone(),
                        inner_key: inner_key.clone(),
                        invalid_packets: invalid_packets.clone(),
                    });
                }
            }
        }
        reports
    }

    pub(super) fn process_blame(&mut self) -> Result<(), RoundError> {
        let reports = self.collect_blame_reports();
        let active: Vec<&BlameReport> = reports.iter().filter(|r| r.reason != BlameReason::Liar).collect();
        let Some(&reason) = active.first().map(|r| &r.reason) else {
            return Ok(());
        };
        if active.iter().any(|r| r.reason != reason) {
            return Err(BlameException::DivergentBlameReasons.into());
        }

        let senders: BTreeSet<VerifyKey> = active.iter().map(|r| r.sender.clone()).collect();
        if senders.len() < self.players.len() {
            if reason == BlameReason::ShuffleFailure {
                self.pile_on_shuffle_failure(&active)?;
            }
            return Ok(());
        }

        // §9 (b): every accused key named by a converged blame must still name a
        // currently seated player. InsufficientFunds is exempt: its offenders are
        // already evicted from `self.players` by the pre-flight check that raised
        // the blame in the first place, before convergence is even checked here.
        if reason != BlameReason::InsufficientFunds && active.iter().any(|r| !self.players.contains_key(&r.accused)) {
            return Err(BlameException::AccusedNotInPlayerSet.into());
        }

        match reason {
            BlameReason::InsufficientFunds => self.resolve_insufficient_funds(&active),
            BlameReason::EquivocationFailure => self.resolve_equivocation_failure(&active),
            BlameReason::ShuffleFailure => self.resolve_shuffle_failure(&active),
            BlameReason::ShuffleAndEquivocationFailure => self.resolve_shuffle_and_equivocation_failure(&active),
            BlameReason::InvalidSignature | BlameReason::MissingOutput | BlameReason::Liar => {
                Err(BlameException::Unresolvable(reason).into())
            }
        }
    }

    /// §4.5, "ShuffleFailure": a single accusation doesn't prove anything on
    /// its own (only the accuser witnessed the failure); every other honest
    /// player piles on with the same accused once it sees exactly one report
    /// that isn't its own, so the round can converge on N reports.
    fn pile_on_shuffle_failure(&mut self, active: &[&BlameReport]) -> Result<(), RoundError> {
        if active.len() != 1 || active[0].sender == self.vk {
            return Ok(());
        }
        let accused = active[0].accused.clone();
        let transcript = self.transcript_hash();
        self.log(format!("piles on the ShuffleFailure blame against {accused}"));
        self.send_blame(BlameReason::ShuffleFailure, accused, None, Some(transcript))
    }

    /// §4.5, "InsufficientFunds". A sender's batch may carry one Blame
    /// envelope per offender (§4.4.2 loops over all underfunded players);
    /// convergence requires every surviving sender to name the identical
    /// offender set.
    fn resolve_insufficient_funds(&mut self, active: &[&BlameReport]) -> Result<(), RoundError> {
        let mut by_sender: BTreeMap<VerifyKey, BTreeSet<VerifyKey>> = BTreeMap::new();
        for report in active {
            by_sender
                .entry(report.sender.clone())
                .or_default()
                .insert(report.accused.clone());
        }
        let mut sets = by_sender.values();
        let first = sets.next().expect("at least one sender reported").clone();
        if sets.any(|s| *s != first) {
            return Err(BlameException::DivergentBlameReasons.into());
        }

        for accused in &first {
            self.ban_the_liar(accused.clone())?;
            self.log(format!("bans {accused} as a liar (insufficient funds)"));
        }
        let accused_vec: Vec<VerifyKey> = first.into_iter().collect();
        self.players = self.players.without(&accused_vec);
        self.inbox.evict(&accused_vec);
        self.inbox.reset(Phase::Blame);

        if accused_vec.contains(&self.vk) {
            self.done = true;
            return Err(BlameException::BannedAsLiar.into());
        }
        self.enter_announcement()
    }

    /// §4.5, "EquivocationFailure". Builds the three evidence maps across
    /// every accuser's attached Announcement+BroadcastOutput blob and
    /// derives the cheater set from them, independent of who was actually
    /// named as `accused`.
    fn resolve_equivocation_failure(&mut self, active: &[&BlameReport]) -> Result<(), RoundError> {
        let mut announced_keys: BTreeMap<VerifyKey, BTreeSet<Vec<u8>>> = BTreeMap::new();
        let mut announced_changes: BTreeMap<VerifyKey, BTreeSet<Option<String>>> = BTreeMap::new();
        let mut broadcast_outputs: BTreeMap<VerifyKey, BTreeSet<BTreeSet<String>>> = BTreeMap::new();

        for report in active {
            let Some(bytes) = &report.invalid_packets else { continue };
            let Ok(evidence) = bincode::deserialize::<EquivocationEvidence>(bytes) else { continue };
            for (vk, batch) in &evidence.phase1 {
                for envelope in batch {
                    if let Message::EncryptionKey { key, change_addr } = &envelope.message {
                        announced_keys.entry(vk.clone()).or_default().insert(key.clone());
                        announced_changes.entry(vk.clone()).or_default().insert(change_addr.clone());
                    }
                }
            }
            for (vk, batch) in &evidence.phase3 {
                let mut outputs = BTreeSet::new();
                for envelope in batch {
                    if let Message::Str(bytes) = &envelope.message {
                        outputs.insert(String::from_utf8_lossy(bytes).into_owned());
                    }
                }
                if !outputs.is_empty() {
                    broadcast_outputs.entry(vk.clone()).or_default().insert(outputs);
                }
            }
        }

        let mut cheaters: BTreeSet<VerifyKey> = announced_keys
            .iter()
            .filter(|(_, eks)| eks.len() > 1)
            .map(|(vk, _)| vk.clone())
            .chain(
                announced_changes
                    .iter()
                    .filter(|(_, changes)| changes.len() > 1)
                    .map(|(vk, _)| vk.clone()),
            )
            .collect();

        // A position that never broadcast phase-3 data at all is folded into
        // the cheater set rather than silently ignored, same as one that
        // broadcast more than one distinct output set.
        let last_vk = self.players.get(self.last_player()).expect("seated index").clone();
        if broadcast_outputs.get(&last_vk).map(|s| s.len()).unwrap_or(0) != 1 {
            cheaters.insert(last_vk);
        }

        if cheaters.is_empty() {
            return Err(BlameException::Unresolvable(BlameReason::EquivocationFailure).into());
        }

        for cheater in &cheaters {
            self.ban_the_liar(cheater.clone())?;
            self.log(format!("bans {cheater} as a liar (equivocation)"));
        }
        let cheater_vec: Vec<VerifyKey> = cheaters.iter().cloned().collect();
        self.players = self.players.without(&cheater_vec);
        self.inbox.evict(&cheater_vec);

        // Every phase but Announcement is purged outright (§4.5): unlike
        // InsufficientFunds and the shuffle-replay outcome, this is the one
        // restart path where the phase-1 inbox itself is worth keeping, so
        // it alone is left for the curation step below instead of being
        // wiped by a blanket reset.
        self.inbox.reset(Phase::Shuffling);
        self.inbox.reset(Phase::BroadcastOutput);
        self.inbox.reset(Phase::EquivocationCheck);
        self.inbox.reset(Phase::VerificationAndSubmission);
        self.inbox.reset(Phase::Signing);
        self.inbox.reset(Phase::Blame);

        // §9, "duplicate admissions" heuristic: drop retained phase-1
        // entries whose announced key coincides with one already recorded
        // in the prior round's `encryption_keys`, before that map is reset
        // by `enter_announcement`.
        let seen_eks: BTreeSet<Vec<u8>> = self.encryption_keys.values().cloned().collect();
        let stale: Vec<VerifyKey> = self
            .inbox
            .phase(Phase::Announcement)
            .iter()
            .filter(|(_, batch)| {
                batch.iter().any(|envelope| {
                    matches!(&envelope.message, Message::EncryptionKey { key, .. } if seen_eks.contains(key))
                })
            })
            .map(|(vk, _)| vk.clone())
            .collect();
        for vk in stale {
            self.inbox.remove(Phase::Announcement, &vk);
        }

        if cheaters.contains(&self.vk) {
            self.done = true;
            return Err(BlameException::BannedAsLiar.into());
        }
        self.enter_announcement()
    }

    /// §4.5, "ShuffleFailure" convergence step: once all N accusations carry
    /// an identical transcript hash, export local key material and the raw
    /// Shuffling-phase packets as evidence for the replay sub-protocol.
    fn resolve_shuffle_failure(&mut self, active: &[&BlameReport]) -> Result<(), RoundError> {
        let hashes: BTreeSet<Vec<u8>> = active.iter().filter_map(|r| r.invalid_packets.clone()).collect();
        if hashes.len() != 1 {
            return Err(BlameException::DivergentShuffleHashes.into());
        }
        let accused_set: BTreeSet<VerifyKey> = active.iter().map(|r| r.accused.clone()).collect();
        if accused_set.len() != 1 {
            return Err(BlameException::DivergentBlameReasons.into());
        }
        let accused = accused_set.into_iter().next().expect("checked len == 1");

        let keypair = self.ephemeral.as_ref().expect("announcement key is set by now");
        let evidence: Vec<(VerifyKey, Batch)> = self
            .inbox
            .phase(Phase::Shuffling)
            .iter()
            .map(|(vk, batch)| (vk.clone(), batch.clone()))
            .collect();
        let payload = bincode::serialize(&evidence).expect("in-memory evidence always serializes");

        self.log(format!("exports key material to attribute blame against {accused}"));
        self.send_blame(
            BlameReason::ShuffleAndEquivocationFailure,
            accused,
            Some(KeyPayload {
                public: keypair.export_public_key(),
                private: Some(keypair.export_private_key()),
            }),
            Some(payload),
        )?;
        self.inbox.reset(Phase::Blame);
        Ok(())
    }

    fn peel_fully(
        &self,
        batch: &Batch,
        order: &[u16],
        keys: &BTreeMap<u16, EphemeralKeyPair>,
    ) -> Result<BTreeSet<String>, RoundError> {
        let mut out = BTreeSet::new();
        for envelope in batch {
            let Message::Str(ciphertext) = &envelope.message else { continue };
            let mut buf = ciphertext.clone();
            for position in order {
                let keypair = keys.get(position).ok_or(LocalFault::CryptoFailure(format!(
                    "missing decryption key for player {position}"
                )))?;
                buf = keypair
                    .decrypt(&buf)
                    .map_err(|e| LocalFault::CryptoFailure(e.to_string()))?;
            }
            out.insert(String::from_utf8_lossy(&buf).into_owned());
        }
        Ok(out)
    }

    /// §4.5, "ShuffleAndEquivocationFailure (replay)". Every peer now holds
    /// every other peer's decryption key; replay the onion at full
    /// decryption depth to find the first hop whose claimed output diverges
    /// from an honest single-address addition.
    fn resolve_shuffle_and_equivocation_failure(&mut self, active: &[&BlameReport]) -> Result<(), RoundError> {
        let mut decryption_keys: BTreeMap<u16, EphemeralKeyPair> = BTreeMap::new();
        let mut received_by: BTreeMap<u16, Batch> = BTreeMap::new();

        for report in active {
            let position = self
                .players
                .index_of(&report.sender)
                .ok_or(BlameException::AccusedNotInPlayerSet)?;
            let inner_key = report
                .inner_key
                .as_ref()
                .ok_or(BlameException::Unresolvable(BlameReason::ShuffleAndEquivocationFailure))?;
            let private = inner_key
                .private
                .as_ref()
                .ok_or(BlameException::Unresolvable(BlameReason::ShuffleAndEquivocationFailure))?;
            let keypair = EphemeralKeyPair::restore_from_privkey(private)
                .map_err(|e| LocalFault::CryptoFailure(e.to_string()))?;
            decryption_keys.insert(position, keypair);

            if let Some(bytes) = &report.invalid_packets {
                if let Ok(evidence) = bincode::deserialize::<Vec<(VerifyKey, Batch)>>(bytes) {
                    for (sender_vk, batch) in evidence {
                        // `received_by` is read back keyed by the receiving position
                        // (`received_by.get(&p)` for p's input, `.get(&next)` for p's
                        // output below), so each evidence entry belongs at the position
                        // right after its Shuffling-phase sender, not the sender's own.
                        if let Some(sender_pos) = self.players.index_of(&sender_vk) {
                            if let Some(receiver_pos) = self.players.next(sender_pos) {
                                received_by.insert(receiver_pos, batch);
                            }
                        }
                    }
                }
            }
        }

        let first = self.first_player();
        let mut cheater = None;
        for p in self.players.indices() {
            if p == self.last_player() {
                break;
            }
            let full_input = if p == first {
                BTreeSet::new()
            } else {
                let batch = received_by.get(&p).cloned().unwrap_or_default();
                let order: Vec<u16> = self.players.indices().filter(|&i| i >= p).collect();
                self.peel_fully(&batch, &order, &decryption_keys)?
            };

            let next = self.players.next(p).expect("p precedes last_player");
            let out_batch = received_by.get(&next).cloned().unwrap_or_default();
            let out_order: Vec<u16> = self.players.indices().filter(|&i| i > p).collect();
            let full_output = self.peel_fully(&out_batch, &out_order, &decryption_keys)?;

            if full_output.symmetric_difference(&full_input).count() != 1 {
                cheater = Some(self.players.get(p).expect("seated index").clone());
                break;
            }
        }

        match cheater {
            Some(vk) if vk != self.vk => {
                self.ban_the_liar(vk.clone())?;
                self.log(format!("bans {vk} as a liar (shuffle replay)"));
                self.players = self.players.without(&[vk]);
                self.inbox.reset_all();
                self.enter_announcement()
            }
            Some(_) => {
                self.done = true;
                Err(BlameException::BannedAsLiar.into())
            }
            None => Err(BlameException::Unresolvable(BlameReason::ShuffleAndEquivocationFailure).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round::test_support::{build_round, seat_players, test_config, vk_at, RecordingChannels};
    use crate::wire::Envelope;

    fn blame_envelope(from_key: VerifyKey, reason: BlameReason, accused: VerifyKey) -> Envelope {
        Envelope {
            session: vec![0xCA, 0xFE],
            phase: Phase::Blame,
            number: 1,
            from_key,
            to_key: None,
            message: Message::Blame {
                reason,
                accused,
                inner_key: None,
                invalid_packets: None,
            },
            signature: Vec::new(),
        }
    }

    #[test]
    fn divergent_reasons_across_full_senders_are_rejected() {
        let (mut keys, players, coin) = seat_players(3, 1_000, 10);
        let channels = RecordingChannels::default();
        let config = test_config(1_000, 10);
        let sk = keys.remove(0); // seated at position 1
        let mut round = build_round(&coin, &channels, config, sk, players.clone(), "outputAddr");

        let p1 = round.vk.clone();
        let p2 = vk_at(&players, 2);
        let p3 = vk_at(&players, 3);

        round.inbox.store(
            Phase::Blame,
            p1.clone(),
            vec![blame_envelope(p1.clone(), BlameReason::InsufficientFunds, p3.clone())],
        );
        round.inbox.store(
            Phase::Blame,
            p2.clone(),
            vec![blame_envelope(p2.clone(), BlameReason::EquivocationFailure, p3.clone())],
        );
        round.inbox.store(
            Phase::Blame,
            p3.clone(),
            vec![blame_envelope(p3.clone(), BlameReason::InsufficientFunds, p3.clone())],
        );

        let err = round
            .process_blame()
            .expect_err("peers reporting different reasons for the same incident cannot converge");
        assert!(matches!(err, RoundError::BlameRaised(BlameException::DivergentBlameReasons)));
    }

    #[test]
    fn insufficient_funds_converges_and_bans_the_offender() {
        let (mut keys, players, coin) = seat_players(3, 1_000, 10);
        let channels = RecordingChannels::default();
        let config = test_config(1_000, 10);
        let sk = keys.remove(0); // seated at position 1
        let mut round = build_round(&coin, &channels, config, sk, players.clone(), "outputAddr");

        let offender = vk_at(&players, 3);
        // Mirrors `run_funds_preflight` having already shrunk the player set
        // before the blame phase's receive loop runs.
        round.players = round.players.without(&[offender.clone()]);
        round.inbox.evict(&[offender.clone()]);

        let p1 = round.vk.clone();
        let p2 = vk_at(&players, 2);
        round.inbox.store(
            Phase::Blame,
            p1.clone(),
            vec![blame_envelope(p1, BlameReason::InsufficientFunds, offender.clone())],
        );
        round.inbox.store(
            Phase::Blame,
            p2.clone(),
            vec![blame_envelope(p2, BlameReason::InsufficientFunds, offender.clone())],
        );

        round.process_blame().expect("two honest survivors naming the same offender converge");
        assert_eq!(round.phase, Phase::Announcement);
        assert!(!round.done);
        assert!(!round.players.contains_key(&offender));
    }

    #[test]
    fn shuffle_replay_identifies_the_forwarder_that_dropped_a_predecessor_address() {
        let (mut keys, players, coin) = seat_players(3, 1_000, 10);
        let channels = RecordingChannels::default();
        let config = test_config(1_000, 10);
        let sk = keys.remove(0); // seated at position 1
        let mut round = build_round(&coin, &channels, config, sk, players.clone(), "addrA");

        let vk1 = round.vk.clone();
        let vk2 = vk_at(&players, 2);
        let vk3 = vk_at(&players, 3);

        let kp1 = EphemeralKeyPair::generate();
        let kp2 = EphemeralKeyPair::generate();
        let kp3 = EphemeralKeyPair::generate();

        // Player 1's onion ciphertext: Enc_EK2(Enc_EK3(addrA)).
        let inner = kp1.encrypt(b"addrA", &kp3.export_public_key()).expect("encrypt");
        let c1 = kp1.encrypt(&inner, &kp2.export_public_key()).expect("encrypt");
        // Player 2's own fresh ciphertext: Enc_EK3(addrB).
        let own2 = kp2.encrypt(b"addrB", &kp3.export_public_key()).expect("encrypt");

        let envelope_for = |from_key: VerifyKey, message: Message| Envelope {
            session: vec![0xCA, 0xFE],
            phase: Phase::Shuffling,
            number: 1,
            from_key,
            to_key: None,
            message,
            signature: Vec::new(),
        };

        // Player 1 forwards a single-entry batch to player 2.
        let batch1: Batch = vec![envelope_for(vk1.clone(), Message::Str(c1))];
        // Player 2 cheats: forwards only its own fresh ciphertext, dropping
        // the carried addrA entry instead of forwarding it alongside its own.
        let batch2: Batch = vec![envelope_for(vk2.clone(), Message::Str(own2))];

        let evidence: Vec<(VerifyKey, Batch)> = vec![(vk1.clone(), batch1), (vk2.clone(), batch2)];
        let evidence_bytes = bincode::serialize(&evidence).expect("evidence always serializes");

        let report_for = |sender: VerifyKey, keypair: &EphemeralKeyPair| BlameReport {
            sender,
            reason: BlameReason::ShuffleAndEquivocationFailure,
            accused: vk2.clone(),
            inner_key: Some(KeyPayload {
                public: keypair.export_public_key(),
                private: Some(keypair.export_private_key()),
            }),
            invalid_packets: Some(evidence_bytes.clone()),
        };

        let r1 = report_for(vk1.clone(), &kp1);
        let r2 = report_for(vk2.clone(), &kp2);
        let r3 = report_for(vk3.clone(), &kp3);
        let active = [&r1, &r2, &r3];

        round
            .resolve_shuffle_and_equivocation_failure(&active)
            .expect("the dropped-address forwarder is identified and the round restarts");
        assert_eq!(round.phase, Phase::Announcement);
        assert!(!round.done);
        assert!(!round.players.contains_key(&vk2), "the cheating forwarder is ejected");
        assert!(round.players.contains_key(&vk1));
        assert!(round.players.contains_key(&vk3));
    }
}
