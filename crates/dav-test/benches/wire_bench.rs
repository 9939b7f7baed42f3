//! Benchmarks for the telegram wire format

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use dav_core::{BaseSubscriptionInfo, DistributorId, TransmitterSubscriptionType};
use dav_wire::{
    join_fragments, split_data, DataTelegram, Frame, FrameDecoder, RoutingUpdate, SubscriptionTelegram, Telegram,
    MAX_DATA_FRAGMENT_SIZE,
};

fn info() -> BaseSubscriptionInfo {
    BaseSubscriptionInfo::new(0x1234_5678, 40, 1)
}

fn routing_update(destinations: u64) -> Telegram {
    Telegram::BestWayUpdate {
        updates: (1..=destinations)
            .map(|d| RoutingUpdate {
                destination: DistributorId::new(d),
                resistance: Some(d as u32 * 3),
                involved: (1..=d.min(6)).map(DistributorId::new).collect(),
            })
            .collect(),
    }
}

fn bench_encode(c: &mut Criterion) {
    let subscription = Telegram::Subscription(SubscriptionTelegram {
        info: info(),
        kind: TransmitterSubscriptionType::Receiver,
        distributors: vec![DistributorId::new(10), DistributorId::new(11)],
    });
    let routing = routing_update(50);

    c.bench_function("encode_subscription", |b| b.iter(|| black_box(&subscription).encode()));
    c.bench_function("encode_best_way_50", |b| b.iter(|| black_box(&routing).encode()));
}

fn bench_decode(c: &mut Criterion) {
    let routing = routing_update(50).encode();
    let data = Telegram::Data(DataTelegram {
        info: info(),
        data_index: 4711,
        telegram_number: 0,
        total_telegrams: 1,
        toward_central: false,
        error_flag: 0,
        payload: Bytes::from(vec![7u8; 1024]),
    })
    .encode();

    c.bench_function("decode_best_way_50", |b| b.iter(|| Telegram::decode(black_box(&routing)).unwrap()));
    c.bench_function("decode_data_1k", |b| b.iter(|| Telegram::decode(black_box(&data)).unwrap()));
}

fn bench_frame_stream(c: &mut Criterion) {
    // 100 keep-alives and 100 small routing updates back to back
    let mut stream = Vec::new();
    for _ in 0..100 {
        stream.extend(Frame::plain(&Telegram::KeepAlive).unwrap().serialize().unwrap());
        stream.extend(Frame::plain(&routing_update(3)).unwrap().serialize().unwrap());
    }

    let mut group = c.benchmark_group("frame_decode_stream");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("200_frames", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&stream[..]);
            let mut decoder = FrameDecoder::new();
            let mut frames = 0;
            while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                frames += 1;
                black_box(frame);
            }
            frames
        })
    });
    group.finish();
}

fn bench_fragmentation(c: &mut Criterion) {
    let payload = Bytes::from(vec![0xABu8; 64 * 1024]);
    let fragments = split_data(info(), 1, false, 0, payload.clone(), MAX_DATA_FRAGMENT_SIZE).unwrap();

    let mut group = c.benchmark_group("fragmentation_64k");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("split", |b| {
        b.iter(|| split_data(info(), 1, false, 0, black_box(payload.clone()), MAX_DATA_FRAGMENT_SIZE).unwrap())
    });
    group.bench_function("join", |b| b.iter(|| join_fragments(black_box(&fragments)).unwrap()));
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_frame_stream, bench_fragmentation);
criterion_main!(benches);
