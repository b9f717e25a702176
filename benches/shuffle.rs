//! Benchmarks the cost of layering and peeling onion-encrypted ciphertext as
//! a function of player count, the dominant per-round cost on the critical
//! path (§4.4.4).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use coinshuffle_core::crypto::EphemeralKeyPair;

const PLAINTEXT: &[u8] = b"1BoatSLRHtKNngkdXEeobR76b53LETtpyT";

fn layer_encrypt(plaintext: &[u8], keypairs: &[EphemeralKeyPair]) -> Vec<u8> {
    let mut ciphertext = plaintext.to_vec();
    for keypair in keypairs.iter().rev() {
        ciphertext = keypair.encrypt(&ciphertext, &keypair.export_public_key()).expect("encrypt");
    }
    ciphertext
}

fn layer_decrypt(mut ciphertext: Vec<u8>, keypairs: &[EphemeralKeyPair]) -> Vec<u8> {
    for keypair in keypairs {
        ciphertext = keypair.decrypt(&ciphertext).expect("decrypt");
    }
    ciphertext
}

fn bench_onion(c: &mut Criterion) {
    let mut group = c.benchmark_group("onion_layering");
    for &players in &[3usize, 5, 10, 20] {
        let keypairs: Vec<EphemeralKeyPair> = (0..players).map(|_| EphemeralKeyPair::generate()).collect();

        group.bench_with_input(BenchmarkId::new("encrypt", players), &players, |b, _| {
            b.iter(|| layer_encrypt(black_box(PLAINTEXT), &keypairs));
        });

        let ciphertext = layer_encrypt(PLAINTEXT, &keypairs);
        group.bench_with_input(BenchmarkId::new("decrypt", players), &players, |b, _| {
            b.iter(|| layer_decrypt(black_box(ciphertext.clone()), &keypairs));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_onion);
criterion_main!(benches);
