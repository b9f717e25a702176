//! Shuffling phase (§4.4.4): the onion. Ciphertext layers are peeled one at a
//! time as the batch is relayed player to player; each forwarder appends its
//! own encrypted address and reshuffles before forwarding.

use std::collections::HashSet;

use rand::seq::SliceRandom;

use crate::channels::Channels;
use crate::coin::CoinAdapter;
use crate::error::{LocalFault, RoundError};
use crate::wire::{Batch, Message, Phase};

use super::Round;

impl<'a, CH: Channels, CO: CoinAdapter> Round<'a, CH, CO> {
    /// Layers `plaintext` with ECIES encryption under every player strictly
    /// after `me`, outermost layer last, per the onion order in §4.4.3.
    fn onion_encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, RoundError> {
        let mut encrypted = plaintext.to_vec();
        let keypair = self.ephemeral.as_ref().expect("announcement key is set by now");
        for i in self.players.from_last_down_to(self.me) {
            let peer_vk = self.players.get(i).expect("seated index");
            let ek = self
                .encryption_keys
                .get(peer_vk)
                .expect("every seated player announced its key");
            encrypted = keypair
                .encrypt(&encrypted, ek)
                .map_err(|e| LocalFault::CryptoFailure(e.to_string()))?;
        }
        Ok(encrypted)
    }

    /// First player's entry into the onion: no inbound batch to peel, just
    /// layer-encrypt `addr_new` and send it on.
    pub(super) fn start_shuffle(&mut self) -> Result<(), RoundError> {
        let ciphertext = self.onion_encrypt(self.addr_new.clone().as_bytes())?;
        let next = self
            .next_player(self.me)
            .expect("first player has a successor when |P| >= 2");
        let next_vk = self.players.get(next).expect("seated index").clone();
        self.send_one(Phase::Shuffling, Some(next_vk), Message::Str(ciphertext))?;
        self.phase = Phase::BroadcastOutput;
        Ok(())
    }

    pub(super) fn process_shuffling(&mut self) -> Result<(), RoundError> {
        let prev = match self.previous_player(self.me) {
            Some(p) => p,
            None => return Ok(()), // first player has no predecessor to wait on
        };
        let prev_vk = self.players.get(prev).expect("seated index").clone();
        let Some(batch) = self.inbox.get(Phase::Shuffling, &prev_vk).cloned() else {
            return Ok(());
        };

        let keypair = self.ephemeral.as_ref().expect("announcement key is set by now");
        let mut decrypted: Vec<Vec<u8>> = Vec::with_capacity(batch.len());
        for envelope in &batch {
            if let Message::Str(ciphertext) = &envelope.message {
                let plaintext = keypair
                    .decrypt(ciphertext)
                    .map_err(|e| LocalFault::CryptoFailure(e.to_string()))?;
                decrypted.push(plaintext);
            }
        }

        let mut seen = HashSet::with_capacity(decrypted.len());
        for entry in &decrypted {
            if !seen.insert(entry.clone()) {
                let transcript = self.transcript_hash();
                let idx = self.players.index_of(&prev_vk);
                self.send_blame(crate::wire::BlameReason::ShuffleFailure, prev_vk, None, Some(transcript))?;
                self.log(format!(
                    "finds a duplicate ciphertext forwarded by player {idx:?}, blames"
                ));
                return Ok(());
            }
        }

        let own = self.onion_encrypt(self.addr_new.clone().as_bytes())?;
        decrypted.push(own);
        decrypted.shuffle(&mut rand::thread_rng());

        if self.me == self.last_player() {
            let addresses: Vec<String> = decrypted
                .into_iter()
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .collect();
            self.new_addresses = addresses.iter().cloned().collect();
            let out_batch: Batch = addresses
                .into_iter()
                .map(|addr| self.sign_envelope(Phase::BroadcastOutput, None, Message::Str(addr.into_bytes())))
                .collect();
            self.send_batch(out_batch)?;
            self.log("peeled the final layer, broadcasts the shuffled output set");
            self.enter_equivocation_check()?;
        } else {
            let next = self.next_player(self.me).expect("non-last has a successor");
            let next_vk = self.players.get(next).expect("seated index").clone();
            let batch: Batch = decrypted
                .into_iter()
                .map(|ciphertext| self.sign_envelope(Phase::Shuffling, Some(next_vk.clone()), Message::Str(ciphertext)))
                .collect();
            self.send_batch(batch)?;
            self.phase = Phase::BroadcastOutput;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::unframe;
    use crate::round::test_support::{build_round, seat_players, test_config, vk_at, RecordingChannels};
    use crate::wire::{decode_batch, BlameReason, Envelope};

    #[test]
    fn duplicate_plaintext_from_predecessor_raises_shuffle_failure() {
        let (mut keys, players, coin) = seat_players(3, 1_000, 10);
        let channels = RecordingChannels::default();
        let config = test_config(1_000, 10);
        let sk = keys.remove(1); // seated at position 2
        let mut round = build_round(&coin, &channels, config, sk, players.clone(), "addrB");
        round.enter_announcement().expect("announce");

        let prev_vk = vk_at(&players, 1);
        let (ct1, ct2) = {
            let keypair = round.ephemeral.as_ref().expect("announce sets ephemeral");
            let own_pub = keypair.export_public_key();
            (
                keypair.encrypt(b"addrA", &own_pub).expect("encrypt"),
                keypair.encrypt(b"addrA", &own_pub).expect("encrypt"),
            )
        };

        let envelope_for = |message: Message| Envelope {
            session: vec![0xCA, 0xFE],
            phase: Phase::Shuffling,
            number: 1,
            from_key: prev_vk.clone(),
            to_key: None,
            message,
            signature: Vec::new(),
        };
        round.inbox.store(
            Phase::Shuffling,
            prev_vk.clone(),
            vec![envelope_for(Message::Str(ct1)), envelope_for(Message::Str(ct2))],
        );

        round.process_shuffling().expect("duplicate is handled, not propagated as an error");
        assert_eq!(round.phase, Phase::Blame);

        let sent = channels.sent.borrow();
        let framed = sent.last().expect("a blame batch was sent").clone();
        let batch = decode_batch(&unframe(framed).expect("framed")).expect("decode");
        match &batch[0].message {
            Message::Blame { reason, accused, .. } => {
                assert_eq!(*reason, BlameReason::ShuffleFailure);
                assert_eq!(*accused, prev_vk);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
