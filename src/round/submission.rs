//! VerificationAndSubmission phase (§4.4.7): builds the joint transaction,
//! signs it, cross-verifies every peer's signature, then submits.

use std::collections::BTreeMap;

use crate::channels::Channels;
use crate::coin::CoinAdapter;
use crate::error::{BlameException, LocalFault, RoundError};
use crate::player::VerifyKey;
use crate::wire::{BlameReason, Message, Phase};

use super::Round;

impl<'a, CH: Channels, CO: CoinAdapter> Round<'a, CH, CO> {
    pub(super) fn enter_verification_and_submission(&mut self) -> Result<(), RoundError> {
        self.phase = Phase::VerificationAndSubmission;

        let inputs: BTreeMap<VerifyKey, String> = self
            .players
            .values()
            .map(|vk| (vk.clone(), self.coin.address(vk)))
            .collect();
        let outputs = self.new_addresses.clone();
        let changes: BTreeMap<VerifyKey, String> = self
            .change_addresses
            .iter()
            .filter_map(|(vk, addr)| addr.clone().map(|addr| (vk.clone(), addr)))
            .collect();

        let tx = self
            .coin
            .make_unsigned_transaction(self.config.amount, self.config.fee, inputs, outputs, changes)
            .ok_or(LocalFault::CoinNetworkFault)?;
        let signature = self.coin.get_transaction_signature(&tx, &self.sk);
        self.transaction = Some(tx);
        self.log("signs the joint transaction");
        self.send_one(Phase::VerificationAndSubmission, None, Message::Signature(signature))
    }

    pub(super) fn process_verification_and_submission(&mut self) -> Result<(), RoundError> {
        if !self.inbox.complete(Phase::VerificationAndSubmission, self.players.len()) {
            return Ok(());
        }
        let tx = self.transaction.clone().expect("built on phase entry");
        let entries: Vec<_> = self
            .inbox
            .phase(Phase::VerificationAndSubmission)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut signatures = BTreeMap::new();
        for (sender, batch) in entries {
            for envelope in batch {
                if let Message::Signature(sig) = envelope.message {
                    if !self.coin.verify_tx_signature(&sig, &tx, &sender) {
                        let idx = self.players.index_of(&sender);
                        self.send_blame(BlameReason::InvalidSignature, sender.clone(), None, None)?;
                        self.log_error(format!("wrong transaction signature from player {idx:?}"));
                        return Err(BlameException::WrongTransactionSignature {
                            accused: idx.unwrap_or(u16::MAX),
                        }
                        .into());
                    }
                    signatures.insert(sender, sig);
                }
            }
        }

        let signed = self.coin.add_transaction_signatures(tx, signatures);
        if self.coin.broadcast_transaction(&signed).is_none() {
            self.log_error("blockchain network fault broadcasting the final transaction");
            self.done = true;
            return Err(LocalFault::CoinNetworkFault.into());
        }
        self.tx = Some(signed);
        self.done = true;
        self.log("broadcasts the final transaction, round complete");
        Ok(())
    }
}
