//! Packet envelope and message schema (§6 "Packet wire format", C1).
//!
//! The wire object is a pure decode/encode boundary: [`Envelope`] is an
//! immutable value, never a reusable scratch buffer (§9, "Raw-bytes
//! re-parsing"). Binary framing uses `bincode` over the `serde` model below;
//! batches are terminated on the transport by the sentinel described in
//! [`crate::channels`].

use serde::{Deserialize, Serialize};

use crate::player::VerifyKey;

/// Stable, wire-ordered phase tag (§6, "Phase enum ordering").
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Phase {
    Announcement,
    Shuffling,
    BroadcastOutput,
    EquivocationCheck,
    VerificationAndSubmission,
    Signing,
    Blame,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::Announcement,
        Phase::Shuffling,
        Phase::BroadcastOutput,
        Phase::EquivocationCheck,
        Phase::VerificationAndSubmission,
        Phase::Signing,
        Phase::Blame,
    ];
}

/// Closed set of blame reasons (§3, §6).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum BlameReason {
    Liar,
    InsufficientFunds,
    EquivocationFailure,
    ShuffleFailure,
    ShuffleAndEquivocationFailure,
    InvalidSignature,
    MissingOutput,
}

/// An embedded key, used both for the phase-1 encryption key announcement
/// and for the shuffle-and-equivocation-failure blame evidence (which also
/// carries the matching private key).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyPayload {
    pub public: Vec<u8>,
    pub private: Option<Vec<u8>>,
}

/// Tagged union of inner message variants (§6, "Message variants").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    /// Phase-1 announcement: ephemeral encryption key plus optional change address.
    EncryptionKey { key: Vec<u8>, change_addr: Option<String> },
    /// Ciphertext (shuffle) or plaintext address (broadcast output).
    Str(Vec<u8>),
    Hash(Vec<u8>),
    Signature(Vec<u8>),
    Blame {
        reason: BlameReason,
        accused: VerifyKey,
        inner_key: Option<KeyPayload>,
        invalid_packets: Option<Vec<u8>>,
    },
}

/// A signed packet envelope (§6, "Envelope").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub session: Vec<u8>,
    pub phase: Phase,
    pub number: u16,
    pub from_key: VerifyKey,
    pub to_key: Option<VerifyKey>,
    pub message: Message,
    pub signature: Vec<u8>,
}

/// An ordered batch of envelopes, the unit exchanged over the wire.
pub type Batch = Vec<Envelope>;

impl Envelope {
    /// Bytes covered by the signature: everything except the signature
    /// field itself.
    pub fn signable_bytes(&self) -> Vec<u8> {
        #[derive(Serialize)]
        struct Signable<'a> {
            session: &'a [u8],
            phase: Phase,
            number: u16,
            from_key: &'a VerifyKey,
            to_key: &'a Option<VerifyKey>,
            message: &'a Message,
        }
        bincode::serialize(&Signable {
            session: &self.session,
            phase: self.phase,
            number: self.number,
            from_key: &self.from_key,
            to_key: &self.to_key,
            message: &self.message,
        })
        .expect("in-memory struct always serializes")
    }
}

pub fn encode_batch(batch: &Batch) -> Vec<u8> {
    bincode::serialize(batch).expect("in-memory batch always serializes")
}

pub fn decode_batch(bytes: &[u8]) -> Result<Batch, bincode::Error> {
    bincode::deserialize(bytes)
}
