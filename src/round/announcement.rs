//! Announcement phase (§4.4.3): each player publishes a fresh ephemeral
//! encryption key and, for the first player, kicks off the onion shuffle.

use crate::channels::Channels;
use crate::coin::CoinAdapter;
use crate::crypto::EphemeralKeyPair;
use crate::error::RoundError;
use crate::wire::{Message, Phase};

use super::Round;

impl<'a, CH: Channels, CO: CoinAdapter> Round<'a, CH, CO> {
    /// (Re-)enters Announcement with a fresh ephemeral key: the initial
    /// entry point and the restart point after a resolved blame. Touches no
    /// inbox slot — each blame resolver clears whichever phases its own
    /// resolution requires before calling this, since what must survive a
    /// restart differs per blame reason (§4.5).
    pub(super) fn enter_announcement(&mut self) -> Result<(), RoundError> {
        self.phase = Phase::Announcement;
        self.encryption_keys.clear();
        self.change_addresses.clear();
        self.new_addresses.clear();

        let keypair = EphemeralKeyPair::generate();
        let public = keypair.export_public_key();
        self.ephemeral = Some(keypair);

        self.log("announces a fresh encryption key");
        self.send_one(
            Phase::Announcement,
            None,
            Message::EncryptionKey {
                key: public,
                change_addr: self.change.clone(),
            },
        )
    }

    pub(super) fn process_announcement(&mut self) -> Result<(), RoundError> {
        if !self.inbox.complete(Phase::Announcement, self.players.len()) {
            return Ok(());
        }
        let batches: Vec<_> = self.inbox.phase(Phase::Announcement).values().cloned().collect();
        for batch in batches {
            for envelope in batch {
                if let Message::EncryptionKey { key, change_addr } = envelope.message {
                    self.encryption_keys.insert(envelope.from_key.clone(), key);
                    self.change_addresses.insert(envelope.from_key, change_addr);
                }
            }
        }
        self.log("has every encryption key, moving to Shuffling");
        self.phase = Phase::Shuffling;

        if self.me == self.first_player() {
            self.start_shuffle()?;
        }
        Ok(())
    }
}
