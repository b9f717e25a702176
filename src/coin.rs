//! Coin adapter contract and an in-memory reference implementation (§6
//! "Coin adapter contract", C3). Out of scope for the core per §1; a real
//! deployment supplies its own chain-facing adapter. The reference impl here
//! exists so the round FSM is runnable in tests and demos, and it reuses the
//! same secp256k1 signature scheme for both envelope signatures and
//! transaction signatures, matching how a wallet's signing key typically
//! backs both in the original protocol.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use curv::arithmetic::traits::Converter;
use curv::cryptographic_primitives::hashing::hash_sha256::HSha256;
use curv::cryptographic_primitives::hashing::traits::Hash;
use curv::elliptic::curves::secp256_k1::{FE, GE};
use curv::elliptic::curves::traits::{ECPoint, ECScalar};
use curv::BigInt;
use serde::{Deserialize, Serialize};

use crate::player::VerifyKey;

/// A single-party Schnorr signing key over secp256k1, used for both
/// envelope and transaction signatures (§6, `verify_signature` /
/// `verify_tx_signature`).
pub struct SigningKey {
    secret: FE,
}

impl SigningKey {
    pub fn generate() -> Self {
        Self {
            secret: ECScalar::new_random(),
        }
    }

    pub fn verify_key(&self) -> VerifyKey {
        let public = GE::generator() * &self.secret;
        VerifyKey(public.pk_to_key_slice())
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        let k: FE = ECScalar::new_random();
        let r_point = GE::generator() * &k;
        let r_bytes = r_point.pk_to_key_slice();
        let vk_bytes = self.verify_key().0;
        let e = challenge_scalar(&r_bytes, &vk_bytes, msg);
        let q = FE::q();
        let s = BigInt::mod_add(
            &k.to_big_int(),
            &BigInt::mod_mul(&e.to_big_int(), &self.secret.to_big_int(), &q),
            &q,
        );
        let mut out = Vec::with_capacity(r_bytes.len() + 32);
        out.extend_from_slice(&(r_bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(&r_bytes);
        out.extend_from_slice(&s.to_bytes());
        out
    }
}

pub fn verify_signature(vk: &VerifyKey, msg: &[u8], sig: &[u8]) -> bool {
    if sig.len() < 2 {
        return false;
    }
    let r_len = u16::from_be_bytes([sig[0], sig[1]]) as usize;
    if sig.len() < 2 + r_len {
        return false;
    }
    let (r_bytes, s_bytes) = (&sig[2..2 + r_len], &sig[2 + r_len..]);
    let r_point = match GE::from_bytes(r_bytes) {
        Ok(p) => p,
        Err(_) => return false,
    };
    let vk_point = match GE::from_bytes(&vk.0) {
        Ok(p) => p,
        Err(_) => return false,
    };
    let e = challenge_scalar(r_bytes, &vk.0, msg);
    let s: FE = ECScalar::from(&BigInt::from_bytes(s_bytes));

    let lhs = GE::generator() * &s;
    let rhs = r_point + vk_point * &e;
    lhs == rhs
}

fn challenge_scalar(r_bytes: &[u8], vk_bytes: &[u8], msg: &[u8]) -> FE {
    let parts = [
        BigInt::from_bytes(r_bytes),
        BigInt::from_bytes(vk_bytes),
        BigInt::from_bytes(msg),
    ];
    let refs: Vec<&BigInt> = parts.iter().collect();
    let h = HSha256::create_hash(&refs);
    ECScalar::from(&h)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTx {
    pub amount: u64,
    pub fee: u64,
    pub inputs: BTreeMap<VerifyKey, String>,
    pub outputs: BTreeSet<String>,
    pub changes: BTreeMap<VerifyKey, String>,
}

/// Coin adapter contract (§6). `None` return values signal a transient
/// network fault, distinct from a well-formed "no" answer.
pub trait CoinAdapter {
    fn address(&self, vk: &VerifyKey) -> String;
    fn sufficient_funds(&self, address: &str, min_amount: u64) -> Option<bool>;
    fn make_unsigned_transaction(
        &self,
        amount: u64,
        fee: u64,
        inputs: BTreeMap<VerifyKey, String>,
        outputs: BTreeSet<String>,
        changes: BTreeMap<VerifyKey, String>,
    ) -> Option<UnsignedTx>;
    fn get_transaction_signature(&self, tx: &UnsignedTx, sk: &SigningKey) -> Vec<u8>;
    fn verify_tx_signature(&self, sig: &[u8], tx: &UnsignedTx, vk: &VerifyKey) -> bool;
    fn add_transaction_signatures(&self, tx: UnsignedTx, sigs: BTreeMap<VerifyKey, Vec<u8>>) -> SignedTx;
    fn broadcast_transaction(&self, tx: &SignedTx) -> Option<(String, u32)>;
    fn verify_signature(&self, sig: &[u8], msg: &[u8], vk: &VerifyKey) -> bool;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTx {
    pub tx: UnsignedTx,
    pub signatures: BTreeMap<VerifyKey, Vec<u8>>,
}

/// In-memory ledger coin adapter used by tests and demos (§4.8).
pub struct TestCoin {
    ledger: Mutex<HashMap<String, u64>>,
    fault_on_query: Mutex<BTreeSet<String>>,
}

impl TestCoin {
    pub fn new() -> Self {
        Self {
            ledger: Mutex::new(HashMap::new()),
            fault_on_query: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn fund(&self, vk: &VerifyKey, amount: u64) {
        let addr = self.address(vk);
        *self.ledger.lock().unwrap().entry(addr).or_insert(0) += amount;
    }

    /// Test hook: make the next `sufficient_funds` query against this
    /// address report a transient network fault (`None`).
    pub fn inject_network_fault(&self, address: &str) {
        self.fault_on_query.lock().unwrap().insert(address.to_string());
    }
}

impl Default for TestCoin {
    fn default() -> Self {
        Self::new()
    }
}

impl CoinAdapter for TestCoin {
    fn address(&self, vk: &VerifyKey) -> String {
        hex::encode(HSha256::create_hash(&[&BigInt::from_bytes(&vk.0)]).to_bytes())
    }

    fn sufficient_funds(&self, address: &str, min_amount: u64) -> Option<bool> {
        if self.fault_on_query.lock().unwrap().remove(address) {
            return None;
        }
        let balance = *self.ledger.lock().unwrap().get(address).unwrap_or(&0);
        Some(balance >= min_amount)
    }

    fn make_unsigned_transaction(
        &self,
        amount: u64,
        fee: u64,
        inputs: BTreeMap<VerifyKey, String>,
        outputs: BTreeSet<String>,
        changes: BTreeMap<VerifyKey, String>,
    ) -> Option<UnsignedTx> {
        Some(UnsignedTx {
            amount,
            fee,
            inputs,
            outputs,
            changes,
        })
    }

    fn get_transaction_signature(&self, tx: &UnsignedTx, sk: &SigningKey) -> Vec<u8> {
        let bytes = bincode::serialize(tx).expect("tx always serializes");
        sk.sign(&bytes)
    }

    fn verify_tx_signature(&self, sig: &[u8], tx: &UnsignedTx, vk: &VerifyKey) -> bool {
        let bytes = bincode::serialize(tx).expect("tx always serializes");
        verify_signature(vk, &bytes, sig)
    }

    fn add_transaction_signatures(&self, tx: UnsignedTx, sigs: BTreeMap<VerifyKey, Vec<u8>>) -> SignedTx {
        SignedTx { tx, signatures: sigs }
    }

    fn broadcast_transaction(&self, tx: &SignedTx) -> Option<(String, u32)> {
        let mut ledger = self.ledger.lock().unwrap();
        for (vk, addr) in &tx.tx.inputs {
            let balance = ledger.entry(addr.clone()).or_insert(0);
            *balance = balance.saturating_sub(tx.tx.amount + tx.tx.fee);
            let _ = vk;
        }
        for out in &tx.tx.outputs {
            *ledger.entry(out.clone()).or_insert(0) += tx.tx.amount;
        }
        for (vk, change_addr) in &tx.tx.changes {
            let _ = vk;
            *ledger.entry(change_addr.clone()).or_insert(0) += 0;
        }
        Some(("accepted".to_string(), 0))
    }

    fn verify_signature(&self, sig: &[u8], msg: &[u8], vk: &VerifyKey) -> bool {
        verify_signature(vk, msg, sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let sk = SigningKey::generate();
        let vk = sk.verify_key();
        let sig = sk.sign(b"hello coinshuffle");
        assert!(verify_signature(&vk, b"hello coinshuffle", &sig));
        assert!(!verify_signature(&vk, b"tampered", &sig));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let sk1 = SigningKey::generate();
        let sk2 = SigningKey::generate();
        let sig = sk1.sign(b"msg");
        assert!(!verify_signature(&sk2.verify_key(), b"msg", &sig));
    }

    #[test]
    fn funds_check_reports_transient_fault_once() {
        let coin = TestCoin::new();
        let sk = SigningKey::generate();
        let vk = sk.verify_key();
        let addr = coin.address(&vk);
        coin.fund(&vk, 100);
        coin.inject_network_fault(&addr);
        assert_eq!(coin.sufficient_funds(&addr, 10), None);
        assert_eq!(coin.sufficient_funds(&addr, 10), Some(true));
    }
}
