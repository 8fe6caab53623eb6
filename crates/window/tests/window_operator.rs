use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use wf_common::{EngineConfig, WindowMode};
use wf_plan::{
    AggKind, Expr, LiteralValue, WindowExpr, WindowFrameBound, WindowFrameExclusion,
    WindowFrameSpec, WindowFrameUnits, WindowFunc,
};
use wf_window::{
    run_window, InterruptSignal, SinkFinalize, SourceResult, WindowOperator,
};

mod support;
use support::*;

fn config_with_threads(threads: usize) -> EngineConfig {
    EngineConfig {
        worker_threads: threads,
        ..EngineConfig::default()
    }
}

#[test]
fn row_number_over_unordered_input_pairs_with_arrival_order() {
    let schema = int_schema(&["x"]);
    let batches = vec![int_batch(&schema, vec![vec![7, 3, 9, 1]])];
    let exprs = vec![WindowExpr {
        func: WindowFunc::RowNumber,
        partition_by: vec![],
        order_by: vec![],
        frame: None,
        output_name: "rn".to_string(),
    }];
    let out = run_window(schema, batches, exprs, config_with_threads(2)).expect("run");

    let mut pairs = Vec::new();
    for batch in &out {
        let xs = i64_column(batch, 0);
        let rns = i64_column(batch, 1);
        pairs.extend(xs.into_iter().zip(rns));
    }
    pairs.sort_by_key(|(_, rn)| *rn);
    assert_eq!(pairs, vec![(7, 1), (3, 2), (9, 3), (1, 4)]);
}

#[test]
fn rank_over_sorted_single_stream_emits_in_order() {
    let schema = int_schema(&["x"]);
    let batches = vec![int_batch(&schema, vec![vec![5, 5, 2, 8]])];
    let exprs = vec![WindowExpr {
        func: WindowFunc::Rank,
        partition_by: vec![],
        order_by: vec![asc("x")],
        frame: None,
        output_name: "r".to_string(),
    }];
    let out = run_window(schema, batches, exprs, config_with_threads(4)).expect("run");

    let mut rows = Vec::new();
    for batch in &out {
        let xs = i64_column(batch, 0);
        let rs = i64_column(batch, 1);
        rows.extend(xs.into_iter().zip(rs));
    }
    // FIXED order: the emitted sequence itself is sorted.
    assert_eq!(rows, vec![(2, 1), (5, 2), (5, 2), (8, 4)]);
}

#[test]
fn running_sum_per_partition() {
    let batches = vec![group_value_batch(&[
        ("A", 1, 10),
        ("A", 2, 20),
        ("B", 1, 5),
        ("A", 3, 30),
        ("B", 2, 7),
    ])];
    let exprs = vec![WindowExpr {
        func: WindowFunc::Aggregate {
            agg: AggKind::Sum,
            arg: col("v"),
        },
        partition_by: vec![col("g")],
        order_by: vec![asc("t")],
        frame: Some(WindowFrameSpec {
            units: WindowFrameUnits::Rows,
            start_bound: WindowFrameBound::UnboundedPreceding,
            end_bound: WindowFrameBound::CurrentRow,
            exclusion: WindowFrameExclusion::NoOthers,
        }),
        output_name: "s".to_string(),
    }];
    let out = run_window(
        group_value_schema(),
        batches,
        exprs,
        config_with_threads(4),
    )
    .expect("run");

    let mut rows = Vec::new();
    for batch in &out {
        let gs = str_column(batch, 0);
        let ts = i64_column(batch, 1);
        let sums = f64_column(batch, 3);
        for i in 0..gs.len() {
            rows.push((gs[i].clone(), ts[i], sums[i]));
        }
    }
    rows.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
    assert_eq!(
        rows,
        vec![
            ("A".to_string(), 1, 10.0),
            ("A".to_string(), 2, 30.0),
            ("A".to_string(), 3, 60.0),
            ("B".to_string(), 1, 5.0),
            ("B".to_string(), 2, 12.0),
        ]
    );
}

#[test]
fn lead_with_default_per_partition() {
    let schema = int_schema(&["p", "i", "x"]);
    let batches = vec![int_batch(
        &schema,
        vec![
            vec![1, 1, 1, 2],
            vec![1, 2, 3, 1],
            vec![10, 20, 30, 100],
        ],
    )];
    let exprs = vec![WindowExpr {
        func: WindowFunc::Lead {
            expr: col("x"),
            offset: 1,
            default: Some(Expr::Literal(LiteralValue::Int64(-1))),
        },
        partition_by: vec![col("p")],
        order_by: vec![asc("i")],
        frame: None,
        output_name: "l".to_string(),
    }];
    let out = run_window(schema, batches, exprs, config_with_threads(4)).expect("run");

    let mut rows = Vec::new();
    for batch in &out {
        let xs = i64_column(batch, 2);
        let leads = i64_column(batch, 3);
        rows.extend(xs.into_iter().zip(leads));
    }
    rows.sort_unstable();
    assert_eq!(rows, vec![(10, 20), (20, 30), (30, -1), (100, -1)]);
}

#[test]
fn ntile_zero_surfaces_a_user_error() {
    let schema = int_schema(&["x"]);
    let batches = vec![int_batch(&schema, vec![vec![1, 2, 3, 4]])];
    let exprs = vec![WindowExpr {
        func: WindowFunc::Ntile { buckets: 0 },
        partition_by: vec![],
        order_by: vec![asc("x")],
        frame: None,
        output_name: "n".to_string(),
    }];
    let err = run_window(schema, batches, exprs, config_with_threads(4)).unwrap_err();
    assert!(err.to_string().contains("NTILE"));
}

#[test]
fn executor_error_with_many_workers_does_not_deadlock() {
    let schema = int_schema(&["p", "x"]);
    let mut ps = Vec::new();
    let mut xs = Vec::new();
    for i in 0..4000_i64 {
        ps.push(i % 37);
        xs.push(i);
    }
    let batches = vec![int_batch(&schema, vec![ps, xs])];
    let exprs = vec![WindowExpr {
        func: WindowFunc::Ntile { buckets: 0 },
        partition_by: vec![col("p")],
        order_by: vec![asc("x")],
        frame: None,
        output_name: "n".to_string(),
    }];
    let config = EngineConfig {
        worker_threads: 8,
        batch_size_rows: 64,
        ..EngineConfig::default()
    };
    let err = run_window(schema, batches, exprs, config).unwrap_err();
    assert!(err.to_string().contains("NTILE"));
}

#[test]
fn thread_count_does_not_change_results() {
    let schema = int_schema(&["p", "x"]);
    let mut ps = Vec::new();
    let mut xs = Vec::new();
    for i in 0..2000_i64 {
        ps.push(i % 17);
        xs.push((i * 31) % 101);
    }
    let exprs = || {
        vec![
            WindowExpr {
                func: WindowFunc::Rank,
                partition_by: vec![col("p")],
                order_by: vec![asc("x")],
                frame: None,
                output_name: "r".to_string(),
            },
            WindowExpr {
                func: WindowFunc::Aggregate {
                    agg: AggKind::Sum,
                    arg: col("x"),
                },
                partition_by: vec![col("p")],
                order_by: vec![asc("x")],
                frame: None,
                output_name: "s".to_string(),
            },
        ]
    };

    let mut reference: Option<Vec<(i64, i64, i64, i64)>> = None;
    for threads in [1, 2, 8] {
        let config = EngineConfig {
            worker_threads: threads,
            batch_size_rows: 128,
            ..EngineConfig::default()
        };
        let batches = vec![int_batch(&schema, vec![ps.clone(), xs.clone()])];
        let out = run_window(Arc::clone(&schema), batches, exprs(), config).expect("run");
        let mut rows = Vec::new();
        for batch in &out {
            let p = i64_column(batch, 0);
            let x = i64_column(batch, 1);
            let r = i64_column(batch, 2);
            let s = f64_column(batch, 3);
            for i in 0..p.len() {
                rows.push((p[i], x[i], r[i], s[i] as i64));
            }
        }
        rows.sort_unstable();
        match &reference {
            None => reference = Some(rows),
            Some(expected) => assert_eq!(&rows, expected, "threads={threads}"),
        }
    }
}

#[test]
fn batch_indices_are_monotone_for_sorted_single_stream() {
    let schema = int_schema(&["x"]);
    let values: Vec<i64> = (0..64).map(|i| 63 - i).collect();
    let batches = vec![int_batch(&schema, vec![values])];
    let exprs = vec![WindowExpr {
        func: WindowFunc::RowNumber,
        partition_by: vec![],
        order_by: vec![asc("x")],
        frame: None,
        output_name: "rn".to_string(),
    }];
    let config = EngineConfig {
        worker_threads: 4,
        batch_size_rows: 8,
        ..EngineConfig::default()
    };
    let out = run_window(schema, batches, exprs, config).expect("run");
    assert!(out.len() > 1, "expected multiple output blocks");

    // FIXED order means concatenating the batches yields the sorted stream
    // with row numbers 1..=64.
    let mut xs = Vec::new();
    let mut rns = Vec::new();
    for batch in &out {
        xs.extend(i64_column(batch, 0));
        rns.extend(i64_column(batch, 1));
    }
    assert_eq!(xs, (0..64).collect::<Vec<_>>());
    assert_eq!(rns, (1..=64).collect::<Vec<_>>());
}

#[test]
fn spilled_groups_produce_the_same_output_and_clean_up() {
    let dir = tempfile::tempdir().expect("tempdir");
    let schema = int_schema(&["p", "x"]);
    let mut ps = Vec::new();
    let mut xs = Vec::new();
    for i in 0..1000_i64 {
        ps.push(i % 7);
        xs.push((i * 13) % 97);
    }
    let exprs = || {
        vec![WindowExpr {
            func: WindowFunc::Aggregate {
                agg: AggKind::Max,
                arg: col("x"),
            },
            partition_by: vec![col("p")],
            order_by: vec![asc("x")],
            frame: None,
            output_name: "m".to_string(),
        }]
    };
    let collect = |out: Vec<arrow::record_batch::RecordBatch>| {
        let mut rows = Vec::new();
        for batch in &out {
            let p = i64_column(batch, 0);
            let x = i64_column(batch, 1);
            let m = i64_column(batch, 2);
            for i in 0..p.len() {
                rows.push((p[i], x[i], m[i]));
            }
        }
        rows.sort_unstable();
        rows
    };

    let spill_config = EngineConfig {
        worker_threads: 4,
        batch_size_rows: 64,
        mem_budget_bytes: 1,
        spill_dir: dir.path().to_string_lossy().into_owned(),
        ..EngineConfig::default()
    };
    let batches = vec![int_batch(&schema, vec![ps.clone(), xs.clone()])];
    let spilled = collect(run_window(Arc::clone(&schema), batches, exprs(), spill_config).expect("run"));

    let resident_config = config_with_threads(4);
    let batches = vec![int_batch(&schema, vec![ps, xs])];
    let resident =
        collect(run_window(Arc::clone(&schema), batches, exprs(), resident_config).expect("run"));

    assert_eq!(spilled, resident);
    // Every spill file was consumed by a flushing evaluate scan.
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .expect("read spill dir")
        .filter_map(|e| e.ok())
        .collect();
    assert!(
        leftovers.is_empty(),
        "spill files left behind: {leftovers:?}"
    );
}

#[test]
fn separate_window_mode_matches_tree_mode_end_to_end() {
    let schema = int_schema(&["p", "x"]);
    let ps: Vec<i64> = (0..500).map(|i| i % 5).collect();
    let xs: Vec<i64> = (0..500).map(|i| (i * 7) % 43).collect();
    let exprs = || {
        vec![WindowExpr {
            func: WindowFunc::Aggregate {
                agg: AggKind::Avg,
                arg: col("x"),
            },
            partition_by: vec![col("p")],
            order_by: vec![asc("x")],
            frame: Some(WindowFrameSpec {
                units: WindowFrameUnits::Rows,
                start_bound: WindowFrameBound::Preceding(3),
                end_bound: WindowFrameBound::Following(2),
                exclusion: WindowFrameExclusion::NoOthers,
            }),
            output_name: "a".to_string(),
        }]
    };
    let run = |mode: WindowMode| {
        let config = EngineConfig {
            worker_threads: 4,
            batch_size_rows: 64,
            window_mode: mode,
            ..EngineConfig::default()
        };
        let batches = vec![int_batch(&schema, vec![ps.clone(), xs.clone()])];
        let out = run_window(Arc::clone(&schema), batches, exprs(), config).expect("run");
        let mut rows = Vec::new();
        for batch in &out {
            let p = i64_column(batch, 0);
            let x = i64_column(batch, 1);
            let a = f64_column(batch, 2);
            for i in 0..p.len() {
                rows.push((p[i], x[i], (a[i] * 1e9).round() as i64));
            }
        }
        rows.sort_unstable();
        rows
    };
    assert_eq!(run(WindowMode::Combine), run(WindowMode::Separate));
}

#[test]
fn empty_input_produces_no_output() {
    let schema = int_schema(&["x"]);
    let exprs = vec![WindowExpr {
        func: WindowFunc::RowNumber,
        partition_by: vec![],
        order_by: vec![asc("x")],
        frame: None,
        output_name: "rn".to_string(),
    }];
    let out = run_window(schema, vec![], exprs, config_with_threads(2)).expect("run");
    assert!(out.is_empty());
}

#[test]
fn stopping_the_source_releases_every_worker() {
    let schema = int_schema(&["p", "x"]);
    let mut ps = Vec::new();
    let mut xs = Vec::new();
    for i in 0..20_000_i64 {
        ps.push(i % 101);
        xs.push(i);
    }
    let config = EngineConfig {
        worker_threads: 8,
        batch_size_rows: 32,
        ..EngineConfig::default()
    };
    let operator = Arc::new(
        WindowOperator::new(
            Arc::clone(&schema),
            vec![WindowExpr {
                func: WindowFunc::Rank,
                partition_by: vec![col("p")],
                order_by: vec![asc("x")],
                frame: None,
                output_name: "r".to_string(),
            }],
            config,
        )
        .expect("operator"),
    );

    let gsink = operator.global_sink().expect("gsink");
    let mut lsink = operator.local_sink(&gsink);
    operator
        .sink(&mut lsink, &int_batch(&schema, vec![ps, xs]))
        .expect("sink");
    operator.combine(&gsink, lsink).expect("combine");
    assert_eq!(operator.finalize(&gsink).expect("finalize"), SinkFinalize::Ready);
    let gsource = operator.global_source(&gsink).expect("gsource");

    let (tx, rx) = mpsc::channel();
    let mut handles = Vec::new();
    for _ in 0..8 {
        let operator = Arc::clone(&operator);
        let gsource = Arc::clone(&gsource);
        let tx = tx.clone();
        handles.push(std::thread::spawn(move || {
            let mut worker = operator.local_source(&gsource);
            let interrupt = InterruptSignal::new();
            loop {
                match operator
                    .get_data(&gsource, &mut worker, &interrupt)
                    .expect("get_data")
                {
                    SourceResult::HaveMoreOutput(batch) => {
                        let _ = tx.send(batch.num_rows());
                    }
                    SourceResult::Blocked => {
                        interrupt.wait(Duration::from_millis(5));
                    }
                    SourceResult::Finished => return,
                }
            }
        }));
    }
    drop(tx);

    // Cancel as soon as the first batch arrives.
    let first = rx.recv_timeout(Duration::from_secs(30)).expect("first batch");
    assert!(first > 0);
    gsource.stop();

    for handle in handles {
        handle.join().expect("worker exits after stop");
    }
    let progress = operator.get_progress(&gsource);
    assert!((-1.0..=1.0).contains(&progress));
}
