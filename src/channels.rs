//! Typed inbound/outbound/log message channels (§4.1, C4).
//!
//! `in.recv()` returning `None` means "idle tick, retry" — the FSM must
//! treat it as a no-op, never as EOF. The reference implementation below is
//! backed by `crossbeam-channel`, mirroring the python reference's
//! `queue.Queue`-backed `Channel`/`ChannelWithPrint` (`commutator_thread.py`);
//! it sits outside the core's trust boundary (§1).

use std::time::Duration;

/// Collaborator boundary the round FSM is generic over, so callers can plug
/// in any real transport. `send`/`recv` are blocking with a timeout; `recv`
/// returns `Ok(None)` on timeout rather than erroring.
pub trait Channels {
    type Error: std::error::Error + Send + Sync + 'static;

    fn send_out(&self, bytes: Vec<u8>) -> Result<(), Self::Error>;
    fn recv_in(&self) -> Result<Option<Vec<u8>>, Self::Error>;
    fn log(&self, message: String);
}

/// Sentinel terminating each batch on the wire (§6, "Framing on the
/// network"): the network frame is the UTF-8 encoding of `⏎`, a 3-byte
/// sequence, stripped on read.
pub const FRAME_SENTINEL: char = '⏎';

pub fn frame(mut batch_bytes: Vec<u8>) -> Vec<u8> {
    let mut sentinel = [0u8; 4];
    let sentinel_bytes = FRAME_SENTINEL.encode_utf8(&mut sentinel).as_bytes();
    batch_bytes.extend_from_slice(sentinel_bytes);
    batch_bytes
}

pub fn unframe(mut framed: Vec<u8>) -> Option<Vec<u8>> {
    let mut sentinel = [0u8; 4];
    let sentinel_bytes = FRAME_SENTINEL.encode_utf8(&mut sentinel).as_bytes();
    if framed.len() < sentinel_bytes.len() || !framed.ends_with(sentinel_bytes) {
        return None;
    }
    framed.truncate(framed.len() - sentinel_bytes.len());
    Some(framed)
}

#[derive(Debug, thiserror::Error)]
pub enum InMemoryChannelError {
    #[error("channel disconnected")]
    Disconnected,
}

/// In-memory reference transport for tests and demos: each player owns an
/// inbound `crossbeam_channel::Receiver`; outbound sends are routed by a
/// relay closure supplied at construction (broadcast fan-out or direct
/// delivery), matching the relay described in §2's data-flow summary.
pub struct InMemoryChannels<F> {
    inbound: crossbeam_channel::Receiver<Vec<u8>>,
    relay: F,
    switch_timeout: Duration,
}

impl<F> InMemoryChannels<F>
where
    F: Fn(Vec<u8>),
{
    pub fn new(inbound: crossbeam_channel::Receiver<Vec<u8>>, relay: F, switch_timeout: Duration) -> Self {
        Self {
            inbound,
            relay,
            switch_timeout,
        }
    }
}

impl<F> Channels for InMemoryChannels<F>
where
    F: Fn(Vec<u8>),
{
    type Error = InMemoryChannelError;

    fn send_out(&self, bytes: Vec<u8>) -> Result<(), Self::Error> {
        (self.relay)(bytes);
        Ok(())
    }

    fn recv_in(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        match self.inbound.recv_timeout(self.switch_timeout) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(None),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(InMemoryChannelError::Disconnected),
        }
    }

    fn log(&self, message: String) {
        tracing::info!(target: "coinshuffle::round", "{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrips() {
        let payload = vec![1, 2, 3, 4, 5];
        let framed = frame(payload.clone());
        assert!(framed.len() > payload.len());
        let unframed = unframe(framed).expect("sentinel present");
        assert_eq!(unframed, payload);
    }

    #[test]
    fn unframe_rejects_missing_sentinel() {
        assert!(unframe(vec![1, 2, 3]).is_none());
    }
}
