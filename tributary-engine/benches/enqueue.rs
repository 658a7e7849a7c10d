use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::time::Duration;

use tributary_engine::export::{ExportResult, Exporter};
use tributary_engine::{BatchConfig, BatchProcessor};

struct NullExporter;

impl Exporter<u64> for NullExporter {
    fn export(&mut self, batch: Vec<u64>) -> ExportResult {
        black_box(batch);
        Ok(())
    }
}

fn processor() -> BatchProcessor<u64> {
    BatchProcessor::builder(NullExporter)
        .with_config(BatchConfig::default().with_scheduled_delay(Duration::from_millis(100)))
        .build()
        .unwrap()
}

fn enqueue_benchmark(c: &mut Criterion) {
    let single = processor();
    c.bench_function("enqueue", |b| {
        let mut i = 0u64;
        b.iter(|| {
            single.enqueue(black_box(i));
            i += 1;
        })
    });
    single.shutdown(Duration::from_secs(5)).unwrap();

    for threads in [2, 4, 8] {
        let shared = processor();
        c.bench_function(&format!("enqueue x{threads} threads"), |b| {
            b.iter(|| {
                std::thread::scope(|scope| {
                    for t in 0..threads {
                        let shared = &shared;
                        scope.spawn(move || {
                            for i in 0..1000u64 {
                                shared.enqueue(black_box(t * 1000 + i));
                            }
                        });
                    }
                });
            })
        });
        shared.shutdown(Duration::from_secs(5)).unwrap();
    }
}

criterion_group!(benches, enqueue_benchmark);
criterion_main!(benches);
