//! Fan-out benchmarks for the Rakewire hub.
//!
//! Publishes go through the same path the server uses: encode once, then a
//! non-blocking enqueue per subscriber.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rakewire_core::{outbound_channel, AllowAll, Hub, HubConfig, Identity, OutboundReceiver, Role};
use rakewire_protocol::{ClientFrame, ServerFrame};
use serde_json::json;
use std::sync::Arc;

fn hub() -> Hub {
    let config = HubConfig {
        heartbeat_interval: None,
        ..HubConfig::default()
    };
    Hub::new(config, Arc::new(AllowAll)).0
}

/// Connect `count` subscribers of `channel`, returning their queues.
fn subscribers(hub: &Hub, channel: &str, count: usize) -> Vec<OutboundReceiver> {
    (0..count)
        .map(|i| {
            let (tx, mut rx) = outbound_channel(1024);
            let id = hub
                .connect(Identity::new(format!("user-{i}"), Role::User), tx)
                .unwrap();
            hub.handle_frame(&id, ClientFrame::subscribe(channel));
            // Subscribe ack
            let _ = rx.try_recv();
            rx
        })
        .collect()
}

fn drain(receivers: &mut [OutboundReceiver]) {
    for rx in receivers {
        while rx.try_recv().is_ok() {}
    }
}

/// One tracking update delivered to a growing audience.
fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish");
    let data = json!({"rakeId": 1, "lat": 19.07, "lng": 72.87, "status": "in_transit"});

    for size in [1, 100, 1000, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let hub = hub();
            let mut receivers = subscribers(&hub, "tracking", size);
            let broadcaster = hub.broadcaster();

            b.iter(|| {
                let report = broadcaster
                    .publish_update(black_box("tracking"), data.clone())
                    .unwrap();
                drain(&mut receivers);
                report
            });
        });
    }

    group.finish();
}

/// Publish with a tenth of the audience no longer reading.
fn bench_publish_with_dead_receivers(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_degraded");
    let frame = ServerFrame::update("tracking", json!({"rakeId": 7}));

    group.bench_function("1000_sub_10pct_gone", |b| {
        let hub = hub();
        let mut receivers = subscribers(&hub, "tracking", 1000);
        let mut live: Vec<_> = receivers
            .drain(..)
            .enumerate()
            .filter_map(|(i, rx)| (i % 10 != 0).then_some(rx))
            .collect();
        let broadcaster = hub.broadcaster();

        b.iter(|| {
            let report = broadcaster.publish(black_box("tracking"), &frame).unwrap();
            drain(&mut live);
            report
        });
    });

    group.finish();
}

/// Subscribe and unsubscribe churn on a busy directory.
fn bench_subscription_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("subscription");

    let hub = hub();
    let _audience = subscribers(&hub, "tracking", 1000);
    let (tx, mut rx) = outbound_channel(1024);
    let id = hub.connect(Identity::new("churn", Role::User), tx).unwrap();

    group.bench_function("subscribe_unsubscribe", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let channel = format!("rake-{}", i % 64);
            i += 1;
            hub.handle_frame(&id, ClientFrame::subscribe(channel.as_str()));
            hub.handle_frame(&id, ClientFrame::unsubscribe(channel.as_str()));
            while rx.try_recv().is_ok() {}
        });
    });

    group.bench_function("stats", |b| b.iter(|| black_box(hub.stats())));

    group.finish();
}

criterion_group!(
    benches,
    bench_publish,
    bench_publish_with_dead_receivers,
    bench_subscription_churn,
);
criterion_main!(benches);
