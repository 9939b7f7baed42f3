//! Benchmarks for distributor login and link encryption

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use dav_core::UserId;
use dav_crypto::{
    derive_frame_ciphers, legacy_digest, ChannelRole, CredentialStore, FakeVerifierSource, SessionKey,
    SrpAuthenticator, SrpClient, SrpVerifier,
};

fn bench_verifier_generate(c: &mut Criterion) {
    c.bench_function("srp_verifier_generate", |b| {
        b.iter(|| SrpVerifier::generate(black_box("mesh"), black_box("mesh-secret")))
    });
}

fn bench_srp_login(c: &mut Criterion) {
    let store = CredentialStore::new();
    store.add_user("mesh", UserId::new(77), "mesh-secret");
    let server = SrpAuthenticator::new(Arc::new(store), Arc::new(FakeVerifierSource::new()));

    c.bench_function("srp_login", |b| {
        b.iter(|| {
            let client = SrpClient::new("mesh");
            let challenge = server.start("mesh", None, &client.public_ephemeral()).unwrap();
            let proof = client
                .process_challenge("mesh-secret", &challenge.salt, &challenge.b)
                .unwrap();
            let success = server.finish(challenge.session, &proof.m1).unwrap();
            black_box(proof.verify_server(&success.m2).unwrap())
        })
    });
}

fn bench_legacy_digest(c: &mut Criterion) {
    c.bench_function("legacy_digest", |b| {
        b.iter(|| legacy_digest(black_box("mesh-secret"), black_box("4711-0815-2342")))
    });
}

fn bench_frame_seal_sizes(c: &mut Criterion) {
    let key = SessionKey([0x42; 32]);
    let sizes = [64, 512, 4096];

    let mut group = c.benchmark_group("frame_seal_by_size");
    for size in sizes {
        let (mut sealer, _) = derive_frame_ciphers(&key, ChannelRole::Client).unwrap();
        let body = vec![0u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{}_bytes", size), |b| {
            b.iter(|| sealer.seal(b"frame", black_box(&body)).unwrap())
        });
    }
    group.finish();
}

fn bench_frame_open(c: &mut Criterion) {
    let key = SessionKey([0x42; 32]);
    let body = vec![0u8; 512];

    c.bench_function("frame_seal_open_512", |b| {
        b.iter(|| {
            // Each opener starts at counter 0, so pair it with a fresh sealer
            let (_, mut opener) = derive_frame_ciphers(&key, ChannelRole::Server).unwrap();
            let (mut sealer, _) = derive_frame_ciphers(&key, ChannelRole::Client).unwrap();
            let sealed = sealer.seal(b"frame", &body).unwrap();
            black_box(opener.open(b"frame", &sealed).unwrap())
        })
    });
}

criterion_group!(
    benches,
    bench_verifier_generate,
    bench_srp_login,
    bench_legacy_digest,
    bench_frame_seal_sizes,
    bench_frame_open
);
criterion_main!(benches);
