//! Round configuration (§6.1, C10). Plain data — the core has no
//! filesystem/env dependency; parsing a config file or environment is the
//! caller's concern.

use std::time::Duration;

use crate::error::LocalFault;

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SessionId(pub Vec<u8>);

/// Scalar round parameters (§3, "Amount/fee"; §4.1, channel timeout).
#[derive(Clone, Debug)]
pub struct RoundConfig {
    pub session: SessionId,
    pub switch_timeout: Duration,
    pub amount: u64,
    pub fee: u64,
}

impl RoundConfig {
    pub fn validate(&self) -> Result<(), LocalFault> {
        if self.amount == 0 {
            return Err(LocalFault::InvalidAmount);
        }
        if self.fee == 0 {
            return Err(LocalFault::InvalidFee);
        }
        Ok(())
    }
}
