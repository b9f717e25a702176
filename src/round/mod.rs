//! Round-level finite state machine (§4.4, C6): the core of a CoinShuffle
//! participant. Owns all round-local state; borrows its collaborators
//! (coin adapter, channels) for the round's lifetime (§3, "Ownership").

mod announcement;
mod blame;
mod broadcast;
mod equivocation;
mod preflight;
mod shuffling;
mod submission;

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use tracing::{info, info_span, warn};

use crate::channels::{frame, unframe, Channels};
use crate::coin::{CoinAdapter, SignedTx, SigningKey, UnsignedTx};
use crate::config::RoundConfig;
use crate::crypto::EphemeralKeyPair;
use crate::error::{BlameException, LocalFault, RoundError};
use crate::inbox::Inbox;
use crate::player::{Identity, PlayerSet, VerifyKey};
use crate::wire::{decode_batch, encode_batch, Batch, BlameReason, Envelope, KeyPayload, Message, Phase};

pub struct Round<'a, CH: Channels, CO: CoinAdapter> {
    config: RoundConfig,
    coin: &'a CO,
    channels: &'a CH,

    sk: SigningKey,
    vk: VerifyKey,
    me: u16,
    players: PlayerSet,

    addr_new: String,
    change: Option<String>,

    phase: Phase,
    inbox: Inbox,

    encryption_keys: BTreeMap<VerifyKey, Vec<u8>>,
    change_addresses: BTreeMap<VerifyKey, Option<String>>,
    ephemeral: Option<EphemeralKeyPair>,

    new_addresses: BTreeSet<String>,
    transaction: Option<UnsignedTx>,

    tx: Option<SignedTx>,
    done: bool,
}

#[allow(clippy::too_many_arguments)]
impl<'a, CH: Channels, CO: CoinAdapter> Round<'a, CH, CO> {
    pub fn new(
        coin: &'a CO,
        channels: &'a CH,
        config: RoundConfig,
        sk: SigningKey,
        players: PlayerSet,
        addr_new: String,
        change: Option<String>,
    ) -> Result<Self, LocalFault> {
        config.validate()?;
        let vk = sk.verify_key();
        let identity = Identity::locate(sk, vk, &players)?;
        Ok(Self {
            config,
            coin,
            channels,
            sk: identity.signing_key,
            vk: identity.verify_key,
            me: identity.me,
            players,
            addr_new,
            change,
            phase: Phase::Announcement,
            inbox: Inbox::new(),
            encryption_keys: BTreeMap::new(),
            change_addresses: BTreeMap::new(),
            ephemeral: None,
            new_addresses: BTreeSet::new(),
            transaction: None,
            tx: None,
            done: false,
        })
    }

    /// Runs the round to completion. Blocks until `done=true` (§6, "Caller
    /// surface"). `Ok(Some(tx))` on success, `Ok(None)` on a local-fatal
    /// `done=true` without a propagated signature, `Err` on an unresolved
    /// blame or a local fault raised via `?`.
    pub fn run(mut self) -> Result<Option<SignedTx>, RoundError> {
        self.log(format!(
            "begins CoinShuffle protocol with {} players",
            self.players.len()
        ));
        if self.run_funds_preflight()? {
            self.enter_announcement()?;
        }
        while !self.done {
            if self.receive_into_inbox()? {
                self.process_inbox()?;
            }
        }
        Ok(self.tx.clone())
    }

    // -- player-set helpers (§3) -----------------------------------------

    fn first_player(&self) -> u16 {
        self.players.first()
    }

    fn last_player(&self) -> u16 {
        self.players.last()
    }

    fn next_player(&self, from: u16) -> Option<u16> {
        self.players.next(from)
    }

    fn previous_player(&self, from: u16) -> Option<u16> {
        self.players.previous(from)
    }

    // -- logging (§7, "User-visible") -------------------------------------

    fn log(&self, message: impl AsRef<str>) {
        let line = format!("Player {} {}", self.me, message.as_ref());
        info!(player = self.me, phase = ?self.phase, "{line}");
        self.channels.log(line);
    }

    fn log_error(&self, message: impl AsRef<str>) {
        warn!(player = self.me, phase = ?self.phase, "{}", message.as_ref());
        self.channels.log(format!("Error: {}", message.as_ref()));
    }

    // -- wire I/O -----------------------------------------------------------

    fn sign_envelope(&self, phase: Phase, to_key: Option<VerifyKey>, message: Message) -> Envelope {
        let mut envelope = Envelope {
            session: self.config.session.0.clone(),
            phase,
            number: self.me,
            from_key: self.vk.clone(),
            to_key,
            message,
            signature: Vec::new(),
        };
        envelope.signature = self.sk.sign(&envelope.signable_bytes());
        envelope
    }

    fn send_batch(&self, batch: Batch) -> Result<(), RoundError> {
        let bytes = frame(encode_batch(&batch));
        self.channels
            .send_out(bytes)
            .map_err(|e| {
                self.log_error(format!("channel send failed: {e}"));
            })
            .unwrap_or(());
        Ok(())
    }

    fn send_one(&self, phase: Phase, to_key: Option<VerifyKey>, message: Message) -> Result<(), RoundError> {
        let envelope = self.sign_envelope(phase, to_key, message);
        self.send_batch(vec![envelope])
    }

    fn send_blame(
        &mut self,
        reason: BlameReason,
        accused: VerifyKey,
        inner_key: Option<KeyPayload>,
        invalid_packets: Option<Vec<u8>>,
    ) -> Result<(), RoundError> {
        self.phase = Phase::Blame;
        self.send_one(
            Phase::Blame,
            None,
            Message::Blame {
                reason,
                accused,
                inner_key,
                invalid_packets,
            },
        )
    }

    fn ban_the_liar(&mut self, accused: VerifyKey) -> Result<(), RoundError> {
        let own_key = self.vk.clone();
        self.send_one(
            Phase::Blame,
            Some(own_key),
            Message::Blame {
                reason: BlameReason::Liar,
                accused,
                inner_key: None,
                invalid_packets: None,
            },
        )
    }

    /// Decodes the next inbound batch (if any), verifies every envelope's
    /// signature, and stores accepted envelopes into the inbox (§4.3,
    /// §9 "Future-phase inbox"). A `None` read is a no-op retry, never EOF.
    fn receive_into_inbox(&mut self) -> Result<bool, RoundError> {
        let framed = match self.channels.recv_in() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(false),
            Err(e) => {
                self.log_error(format!("channel recv failed: {e}"));
                return Ok(false);
            }
        };
        let Some(raw) = unframe(framed) else {
            self.log_error("decoding error: missing frame sentinel");
            return Ok(false);
        };
        let batch = match decode_batch(&raw) {
            Ok(batch) => batch,
            Err(_) => {
                self.log_error("decoding error");
                return Ok(false);
            }
        };
        if batch.is_empty() {
            return Ok(false);
        }
        self.check_signatures(&batch)?;
        let phase = batch[0].phase;
        let sender = batch[0].from_key.clone();
        if self.players.contains_key(&sender) {
            self.inbox.store(phase, sender, batch);
        }
        Ok(true)
    }

    /// Signature gate (§4.3, invariant 2): rejects any batch containing an
    /// envelope whose signature doesn't verify, raising InvalidSignature
    /// blame against that sender.
    fn check_signatures(&mut self, batch: &Batch) -> Result<(), RoundError> {
        for envelope in batch {
            let ok = self
                .coin
                .verify_signature(&envelope.signature, &envelope.signable_bytes(), &envelope.from_key);
            if !ok {
                let accused = envelope.from_key.clone();
                let idx = self.players.index_of(&accused);
                self.send_blame(BlameReason::InvalidSignature, accused, None, None)?;
                self.log_error(format!(
                    "player {idx:?} sent a message with wrong signature!"
                ));
                return Err(BlameException::InvalidSignature {
                    accused: idx.unwrap_or(u16::MAX),
                }
                .into());
            }
        }
        Ok(())
    }

    fn process_inbox(&mut self) -> Result<(), RoundError> {
        let span = info_span!("phase", player = self.me, phase = ?self.phase);
        let _enter = span.enter();
        if self.blame_pending() {
            self.process_blame()
        } else {
            match self.phase {
                Phase::Announcement => self.process_announcement(),
                Phase::Shuffling => self.process_shuffling(),
                Phase::BroadcastOutput => self.process_broadcast_output(),
                Phase::EquivocationCheck => self.process_equivocation_check(),
                Phase::VerificationAndSubmission => self.process_verification_and_submission(),
                Phase::Signing | Phase::Blame => Ok(()),
            }
        }
    }

    fn blame_pending(&self) -> bool {
        !self.inbox.phase(Phase::Blame).is_empty()
    }
}

/// Shared fixtures for the per-phase unit tests in this module's siblings:
/// a recording [`Channels`] mock and a helper that builds an N-player
/// [`Round`] seated at a given position, funded on a shared [`TestCoin`].
#[cfg(test)]
pub(super) mod test_support {
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use crate::channels::Channels;
    use crate::coin::{SigningKey, TestCoin};
    use crate::config::{RoundConfig, SessionId};
    use crate::player::{PlayerSet, VerifyKey};

    use super::Round;

    #[derive(Default)]
    pub(crate) struct RecordingChannels {
        pub(crate) sent: RefCell<Vec<Vec<u8>>>,
        pub(crate) logs: RefCell<Vec<String>>,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("recording channel never errors")]
    pub(crate) struct Never;

    impl Channels for RecordingChannels {
        type Error = Never;

        fn send_out(&self, bytes: Vec<u8>) -> Result<(), Self::Error> {
            self.sent.borrow_mut().push(bytes);
            Ok(())
        }

        fn recv_in(&self) -> Result<Option<Vec<u8>>, Self::Error> {
            Ok(None)
        }

        fn log(&self, message: String) {
            self.logs.borrow_mut().push(message);
        }
    }

    /// Builds `n` signing keys seated at positions 1..=n and a shared,
    /// fully-funded [`TestCoin`].
    pub(crate) fn seat_players(n: u16, amount: u64, fee: u64) -> (Vec<SigningKey>, PlayerSet, TestCoin) {
        let keys: Vec<SigningKey> = (0..n).map(|_| SigningKey::generate()).collect();
        let mut map = BTreeMap::new();
        let coin = TestCoin::new();
        for (i, k) in keys.iter().enumerate() {
            let vk = k.verify_key();
            coin.fund(&vk, amount + fee + 1_000);
            map.insert((i + 1) as u16, vk);
        }
        (keys, PlayerSet::new(map), coin)
    }

    pub(crate) fn test_config(amount: u64, fee: u64) -> RoundConfig {
        RoundConfig {
            session: SessionId(vec![0xCA, 0xFE]),
            switch_timeout: Duration::from_millis(50),
            amount,
            fee,
        }
    }

    pub(crate) fn build_round<'a>(
        coin: &'a TestCoin,
        channels: &'a RecordingChannels,
        config: RoundConfig,
        sk: SigningKey,
        players: PlayerSet,
        addr_new: &str,
    ) -> Round<'a, RecordingChannels, TestCoin> {
        Round::new(coin, channels, config, sk, players, addr_new.to_string(), None)
            .expect("own key is seated and config is valid")
    }

    pub(crate) fn vk_at(players: &PlayerSet, index: u16) -> VerifyKey {
        players.get(index).expect("seated index").clone()
    }
}
