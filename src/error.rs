use thiserror::Error;

use crate::wire::BlameReason;

/// Local, non-recoverable faults. The round cannot continue; `done` is set
/// and no further packets are sent.
#[derive(Debug, Error)]
pub enum LocalFault {
    #[error("own verification key is not present in the player set")]
    NotInPlayerSet,
    #[error("duplicate verification keys in the player set")]
    DuplicatePlayers,
    #[error("own funds are insufficient for amount+fee")]
    OwnFundsInsufficient,
    #[error("fewer than two funded players remain")]
    NotEnoughPlayers,
    #[error("blockchain network fault")]
    CoinNetworkFault,
    #[error("amount must be greater than zero")]
    InvalidAmount,
    #[error("fee must be greater than zero")]
    InvalidFee,
    #[error("cryptographic operation failed: {0}")]
    CryptoFailure(String),
}

/// A blame raised against a peer that terminates the round rather than
/// restarting it: either the round gave up on attribution, or attribution
/// itself failed (divergent reasons/hashes reported by honest peers).
#[derive(Debug, Error)]
pub enum BlameException {
    #[error("player {accused} sent a message with an invalid signature")]
    InvalidSignature { accused: u16 },
    #[error("wrong transaction signature from player {accused}")]
    WrongTransactionSignature { accused: u16 },
    #[error("players reported different blame reasons for the same incident")]
    DivergentBlameReasons,
    #[error("blame message accuses a key outside the current player set")]
    AccusedNotInPlayerSet,
    #[error("peers reported divergent shuffle transcript hashes")]
    DivergentShuffleHashes,
    #[error("blame reason {0:?} carried no attributable accused key")]
    Unresolvable(BlameReason),
    #[error("local player was identified as the cheater during blame resolution")]
    BannedAsLiar,
}

#[derive(Debug, Error)]
pub enum RoundError {
    #[error("local fault: {0}")]
    LocalFault(#[from] LocalFault),
    #[error("blame raised: {0}")]
    BlameRaised(#[from] BlameException),
}
