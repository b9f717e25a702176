//! Pre-flight funds check (§4.4.1): every player's balance is checked against
//! `amount+fee` before the first Announcement is ever sent.

use crate::channels::Channels;
use crate::coin::CoinAdapter;
use crate::error::{LocalFault, RoundError};
use crate::wire::{BlameReason, Message, Phase};

use super::Round;

impl<'a, CH: Channels, CO: CoinAdapter> Round<'a, CH, CO> {
    /// Returns `Ok(true)` when every seated player has sufficient funds and
    /// the round should proceed straight to Announcement. Returns `Ok(false)`
    /// when blame packets were broadcast for underfunded players and the
    /// round must now run its normal receive loop to converge on them.
    pub(super) fn run_funds_preflight(&mut self) -> Result<bool, RoundError> {
        let mut offenders = Vec::new();
        for vk in self.players.values().cloned().collect::<Vec<_>>() {
            let addr = self.coin.address(&vk);
            match self.coin.sufficient_funds(&addr, self.config.amount + self.config.fee) {
                None => {
                    self.log_error("blockchain network fault during pre-flight funds check");
                    self.done = true;
                    return Err(LocalFault::CoinNetworkFault.into());
                }
                Some(true) => {}
                Some(false) => offenders.push(vk),
            }
        }

        if offenders.is_empty() {
            self.log("finds every player sufficiently funded");
            return Ok(true);
        }

        if offenders.contains(&self.vk) {
            self.log_error("own funds are insufficient for amount+fee");
            self.done = true;
            return Err(LocalFault::OwnFundsInsufficient.into());
        }

        // Every offender is named in a single batch (§4.3: "a batch is an
        // ordered list of envelopes") so a receiver's one Blame inbox slot
        // for this sender retains all of them, not just the last.
        self.phase = Phase::Blame;
        let batch: Vec<_> = offenders
            .iter()
            .map(|offender| {
                let idx = self.players.index_of(offender);
                self.log(format!("blames player {idx:?} for insufficient funds"));
                self.sign_envelope(
                    Phase::Blame,
                    None,
                    Message::Blame {
                        reason: BlameReason::InsufficientFunds,
                        accused: offender.clone(),
                        inner_key: None,
                        invalid_packets: None,
                    },
                )
            })
            .collect();
        self.send_batch(batch)?;
        self.players = self.players.without(&offenders);
        self.inbox.evict(&offenders);

        if self.players.len() <= 1 {
            self.log_error("not enough players with sufficient funds remain");
            self.done = true;
            return Err(LocalFault::NotEnoughPlayers.into());
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coin::CoinAdapter;
    use crate::round::test_support::{build_round, seat_players, test_config, vk_at, RecordingChannels};

    #[test]
    fn network_fault_during_funds_check_is_fatal() {
        let (mut keys, players, coin) = seat_players(3, 1_000, 10);
        let channels = RecordingChannels::default();
        let config = test_config(1_000, 10);
        let sk = keys.remove(0); // seated at position 1
        let faulted_vk = vk_at(&players, 1);
        coin.inject_network_fault(&coin.address(&faulted_vk));
        let mut round = build_round(&coin, &channels, config, sk, players, "outputAddr");

        let err = round
            .run_funds_preflight()
            .expect_err("a transient network fault must abort the round, not be swallowed");
        assert!(matches!(err, RoundError::LocalFault(LocalFault::CoinNetworkFault)));
        assert!(round.done, "a local fault during pre-flight is terminal");
    }

    #[test]
    fn underfunded_peer_is_blamed_in_a_single_batch() {
        use std::collections::BTreeMap;

        use crate::coin::{SigningKey, TestCoin};
        use crate::player::PlayerSet;

        let coin = TestCoin::new();
        let keys: Vec<SigningKey> = (0..3).map(|_| SigningKey::generate()).collect();
        let mut map = BTreeMap::new();
        for (i, k) in keys.iter().enumerate() {
            let vk = k.verify_key();
            if i != 2 {
                coin.fund(&vk, 2_000);
            }
            map.insert((i + 1) as u16, vk);
        }
        let players = PlayerSet::new(map);
        let offender_vk = vk_at(&players, 3);

        let channels = RecordingChannels::default();
        let config = test_config(1_000, 10);
        let mut keys = keys;
        let sk = keys.remove(0); // seated at position 1
        let mut round = build_round(&coin, &channels, config, sk, players, "outputAddr");

        let proceeds = round.run_funds_preflight().expect("own funds are sufficient");
        assert!(!proceeds, "an underfunded peer must stop the honest path before Announcement");
        assert_eq!(round.players.len(), 2);
        assert!(!round.players.contains_key(&offender_vk));

        let sent = channels.sent.borrow();
        assert_eq!(sent.len(), 1, "every offender must be named in one batch");
    }
}
