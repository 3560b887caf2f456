use std::time::{Duration, SystemTime};

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::{Map, Value};
use tokio::time::Instant;
use unitwatch::pid::{ServiceIdentity, ServiceKind};
use unitwatch::pipeline::buffer::RowBuffer;
use unitwatch::pipeline::row::{EventContext, Row, ServiceSample};
use unitwatch::sampler::CpuUsage;
use unitwatch::sink::http::encode_ndjson;

fn sampled_row(pid: u32) -> Row {
    let sample = ServiceSample {
        identity: ServiceIdentity::new(format!("unit-{pid}.service"), pid, ServiceKind::SystemdUnit),
        usage: CpuUsage::new(12.5, 3.25),
        measured_at: SystemTime::now(),
    };
    Row::from_sample(&sample, "bench-host")
}

fn event_row(idx: u32) -> Row {
    let ctx = EventContext {
        table: "deploy_events",
        hostname: "bench-host",
        node_type: "worker",
        event_id: "6f1c2d9e-8f0a-4b7e-9d52-1a2b3c4d5e6f",
        cluster_id: "bench",
        received_at: SystemTime::now(),
    };
    let mut data = Map::new();
    data.insert("phase".to_string(), Value::from("rollout"));
    data.insert("step".to_string(), Value::from(idx));
    Row::from_event(&ctx, data)
}

fn bench_buffer_push(c: &mut Criterion) {
    let rows: Vec<Row> = (0..1_000).map(sampled_row).collect();

    c.bench_function("row_buffer/push_1000_size_flush", |b| {
        b.iter(|| {
            let now = Instant::now();
            let mut buffer = RowBuffer::new(1_000, Duration::from_secs(10), now);
            let flushes = buffer.extend(rows.iter().cloned(), now);
            black_box(flushes.len())
        })
    });
}

fn bench_encode_ndjson(c: &mut Criterion) {
    let mut rows: Vec<Row> = (0..256).map(sampled_row).collect();
    rows.extend((0..256).map(event_row));
    let mut buf = Vec::with_capacity(rows.len() * 256);

    c.bench_function("ndjson/encode_512_rows", |b| {
        b.iter(|| {
            buf.clear();
            encode_ndjson(black_box(&rows), "service_cpu_usage", &mut buf).expect("encode");
            black_box(buf.len())
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_buffer_push(c);
    bench_encode_ndjson(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
