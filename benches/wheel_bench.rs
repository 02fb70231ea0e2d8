//! Timing-wheel micro-benchmarks.
//!
//! Measures:
//! 1. insert/reap cost for a batch of immediate-deadline packets
//! 2. paced insert into spread-out slots plus a full-ring reap
//!
//! Run with:
//! ```bash
//! cargo bench --bench wheel_bench
//! ```

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use pacerpc::timing::{measure_rdtsc_freq, rdtsc};
use pacerpc::{TimingWheel, TxPkt, WheelArgs};

const MTU: usize = 1024;

fn wheel_args(freq_ghz: f64) -> WheelArgs {
    WheelArgs {
        mtu: MTU,
        freq_ghz,
        wslot_width_us: 0.5,
        min_rate_gbps: 1.0,
        session_credits: 32,
    }
}

fn dummy_pkt() -> TxPkt {
    TxPkt {
        route: 1,
        tag: 0,
        bytes: Vec::new(),
    }
}

fn bench_insert_reap(c: &mut Criterion) {
    let freq_ghz = measure_rdtsc_freq();
    let mut group = c.benchmark_group("wheel");

    for batch in [32usize, 256] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(
            BenchmarkId::new("insert_reap_due", batch),
            &batch,
            |b, &batch| {
                let mut wheel = TimingWheel::new(&wheel_args(freq_ghz), rdtsc());
                b.iter(|| {
                    let now = rdtsc();
                    for _ in 0..batch {
                        wheel.insert(dummy_pkt(), now, now).unwrap();
                    }
                    wheel.reap(now);
                    wheel.ready_queue.clear();
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("insert_reap_spread", batch),
            &batch,
            |b, &batch| {
                let mut wheel = TimingWheel::new(&wheel_args(freq_ghz), rdtsc());
                let width = wheel.wslot_width_tsc();
                // Virtual clock: the wheel re-bases on every reap, so the
                // bench advances its own time instead of chasing rdtsc.
                let mut vnow = rdtsc();
                b.iter(|| {
                    for i in 0..batch {
                        let deadline = vnow + (i as u64 % 64) * width;
                        wheel.insert(dummy_pkt(), deadline, vnow).unwrap();
                    }
                    vnow += 64 * width;
                    wheel.reap(vnow);
                    wheel.ready_queue.clear();
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_insert_reap);
criterion_main!(benches);
