use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use std::sync::Arc;
use tempfile::TempDir;
use tsmerge_core::fileset::FileSetManager;
use tsmerge_core::limiter::ThroughputLimiter;
use tsmerge_core::merge::{
    ChunkMergePlan, MergeExecutor, MergeTask, PlanThresholds, Recency, SourceChunk,
};
use tsmerge_core::metrics::MergeMetrics;
use tsmerge_core::recovery::{MergeLog, MERGE_LOG_FILE};
use tsmerge_core::selector::CandidateSelector;
use tsmerge_core::tsfile::{partition_dir, ChunkMeta, FileHeader, TsFileWriter};
use tsmerge_core::{MergeConfig, SeriesKey, TimeRange, TimeValue};

struct Fixture {
    _dir: TempDir,
    fileset: Arc<FileSetManager>,
    executor: MergeExecutor,
    config: Arc<MergeConfig>,
}

fn fixture(files: usize, series: usize, points: i64) -> Fixture {
    let dir = TempDir::new().expect("tempdir");
    let config = Arc::new(MergeConfig {
        seq_file_num_in_each_level: files - 1,
        merge_read_throughput_mb_per_sec: 0,
        merge_write_throughput_mb_per_sec: 0,
        ..MergeConfig::new(dir.path())
    });
    let log = Arc::new(MergeLog::open(dir.path().join(MERGE_LOG_FILE)).expect("merge log"));
    let fileset = Arc::new(FileSetManager::new(config.clone(), Some(log.clone())));

    for f in 0..files as i64 {
        let header = FileHeader::new(
            fileset.allocate_file_id(),
            fileset.allocate_version(),
            "root.bench",
            0,
            0,
            true,
        );
        let part = partition_dir(&config.data_dir, "root.bench", 0);
        let mut writer = TsFileWriter::create(&part, header, true).expect("writer");
        for s in 0..series {
            let key = SeriesKey::new("cpu", "usage").with_tag("host", format!("h{}", s));
            let batch: Vec<_> = (0..points)
                .map(|t| TimeValue::new(f * points + t, t as f64))
                .collect();
            writer.write_points(&key, &batch).expect("write");
        }
        let meta = writer.finish().expect("finish").publish().expect("publish");
        fileset.register(meta).expect("register");
    }

    let executor = MergeExecutor::new(
        config.clone(),
        fileset.clone(),
        log,
        Arc::new(ThroughputLimiter::unlimited()),
        Arc::new(MergeMetrics::new()),
    )
    .expect("executor");

    Fixture {
        _dir: dir,
        fileset,
        executor,
        config,
    }
}

fn bench_inner_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    group.sample_size(10);

    for (name, series, points) in [("wide_4x64x1k", 64, 1_000), ("deep_4x4x20k", 4, 20_000)] {
        group.bench_function(name, |b| {
            b.iter_batched(
                || fixture(4, series, points),
                |fx| {
                    let candidates = fx.fileset.select_promotion_candidates("root.bench", 0);
                    let selection = CandidateSelector::from_config(&fx.config)
                        .select_first(&candidates)
                        .expect("selection");
                    let mut task = MergeTask::new(
                        selection,
                        fx.fileset.allocate_file_id(),
                        &fx.config.data_dir,
                        fx.config.merge_file_strategy,
                    );
                    assert!(fx.fileset.begin_merge(&task));
                    black_box(fx.executor.run(&mut task).expect("merge"));
                },
                BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

fn bench_chunk_plan(c: &mut Criterion) {
    let chunks: Vec<_> = (0..4096)
        .map(|i: i64| SourceChunk {
            input: (i % 8) as usize,
            recency: Recency {
                unsequence: i % 3 == 0,
                version: (i % 8) as u64,
                input_order: (i % 8) as usize,
            },
            meta: ChunkMeta {
                series: SeriesKey::new("cpu", "usage"),
                offset: 0,
                size: 0,
                point_count: ((i * 37) % 3000) as u32,
                time_range: TimeRange::new(i * 100, i * 100 + 150),
            },
        })
        .collect();
    let thresholds = PlanThresholds::from_config(&MergeConfig::default());

    c.bench_function("chunk_plan_4k", |b| {
        b.iter(|| {
            ChunkMergePlan::build(
                SeriesKey::new("cpu", "usage"),
                black_box(chunks.clone()),
                thresholds,
            )
        })
    });
}

criterion_group!(benches, bench_inner_merge, bench_chunk_plan);
criterion_main!(benches);
