//! BroadcastOutput phase (§4.4.5): every non-last player waits for the final
//! shuffled address set and confirms its own address survived.

use std::collections::BTreeSet;

use crate::channels::Channels;
use crate::coin::CoinAdapter;
use crate::error::RoundError;
use crate::wire::{BlameReason, Message, Phase};

use super::Round;

impl<'a, CH: Channels, CO: CoinAdapter> Round<'a, CH, CO> {
    pub(super) fn process_broadcast_output(&mut self) -> Result<(), RoundError> {
        let last = self.last_player();
        if self.me == last {
            // The last player built and broadcast O inline while peeling the
            // final onion layer (§4.4.4); nothing further to wait for here.
            return Ok(());
        }
        let last_vk = self.players.get(last).expect("seated index").clone();
        let Some(batch) = self.inbox.get(Phase::BroadcastOutput, &last_vk).cloned() else {
            return Ok(());
        };

        let mut addresses = BTreeSet::new();
        for envelope in &batch {
            if let Message::Str(bytes) = &envelope.message {
                addresses.insert(String::from_utf8_lossy(bytes).into_owned());
            }
        }
        self.new_addresses = addresses;

        if !self.new_addresses.contains(&self.addr_new) {
            let transcript = self.transcript_hash();
            self.send_blame(BlameReason::ShuffleFailure, last_vk, None, Some(transcript))?;
            self.log_error("own address is missing from the broadcast output set");
            return Ok(());
        }
        self.log("confirms its address survived the shuffle, moving to EquivocationCheck");
        self.enter_equivocation_check()
    }
}
