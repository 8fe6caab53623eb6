//! Embedded driver: runs the whole sink → finalize → get-data pipeline on OS
//! worker threads. Integration tests and embedded hosts use this; pipeline
//! engines are expected to call the operator entry points directly.

use std::sync::Arc;
use std::time::Duration;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use tracing::info;
use wf_common::{EngineConfig, Result, WfError};
use wf_plan::WindowExpr;

use crate::operator::{OrderPreservation, SinkFinalize, SourceResult, WindowOperator};
use crate::source::InterruptSignal;

/// How long a blocked worker parks before re-polling. The blocked queue wakes
/// it earlier; the timeout only bounds the wait.
const BLOCKED_PARK: Duration = Duration::from_millis(10);

/// Evaluate window descriptors over the given batches and collect the output.
///
/// Sinks run on one thread when any descriptor is order dependent (rows must
/// be seen in arrival order), otherwise on every worker thread. Output batch
/// order follows `batch_index` when the operator preserves order.
pub fn run_window(
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    exprs: Vec<WindowExpr>,
    config: EngineConfig,
) -> Result<Vec<RecordBatch>> {
    let operator = WindowOperator::new(schema, exprs, config)?;
    run_operator(&operator, batches)
}

/// Drive a constructed operator end to end.
pub fn run_operator(
    operator: &WindowOperator,
    batches: Vec<RecordBatch>,
) -> Result<Vec<RecordBatch>> {
    let gsink = operator.global_sink()?;
    let threads = operator.config().effective_worker_threads();

    let sink_threads = if operator.is_order_dependent() {
        1
    } else {
        threads.max(1)
    };
    let shares = split_round_robin(batches, sink_threads);
    std::thread::scope(|scope| -> Result<()> {
        let mut handles = Vec::new();
        for share in shares {
            let gsink = Arc::clone(&gsink);
            handles.push(scope.spawn(move || -> Result<()> {
                let mut lsink = operator.local_sink(&gsink);
                for batch in &share {
                    operator.sink(&mut lsink, batch)?;
                }
                operator.combine(&gsink, lsink)?;
                Ok(())
            }));
        }
        for handle in handles {
            handle
                .join()
                .map_err(|_| WfError::Internal("sink thread panicked".to_string()))??;
        }
        Ok(())
    })?;

    if operator.finalize(&gsink)? == SinkFinalize::NoOutputPossible {
        return Ok(Vec::new());
    }

    let gsource = operator.global_source(&gsink)?;
    let workers = gsource.max_threads().min(threads).max(1);
    info!(workers, "window source started");

    let mut indexed: Vec<(usize, RecordBatch)> = Vec::new();
    std::thread::scope(|scope| -> Result<()> {
        let mut handles = Vec::new();
        for _ in 0..workers {
            let gsource = Arc::clone(&gsource);
            handles.push(scope.spawn(move || -> Result<Vec<(usize, RecordBatch)>> {
                let mut worker = operator.local_source(&gsource);
                let interrupt = InterruptSignal::new();
                let mut out = Vec::new();
                loop {
                    match operator.get_data(&gsource, &mut worker, &interrupt)? {
                        SourceResult::HaveMoreOutput(batch) => {
                            out.push((operator.get_batch_index(&worker), batch));
                        }
                        SourceResult::Blocked => {
                            interrupt.wait(BLOCKED_PARK);
                        }
                        SourceResult::Finished => return Ok(out),
                    }
                }
            }));
        }
        let mut first_error = None;
        for handle in handles {
            match handle
                .join()
                .map_err(|_| WfError::Internal("worker thread panicked".to_string()))?
            {
                Ok(mut out) => indexed.append(&mut out),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    })?;

    if operator.source_order() == OrderPreservation::FixedOrder {
        indexed.sort_by_key(|(idx, _)| *idx);
    }
    Ok(indexed.into_iter().map(|(_, batch)| batch).collect())
}

fn split_round_robin(batches: Vec<RecordBatch>, shares: usize) -> Vec<Vec<RecordBatch>> {
    let shares = shares.max(1);
    let mut out = vec![Vec::new(); shares];
    for (i, batch) in batches.into_iter().enumerate() {
        out[i % shares].push(batch);
    }
    out
}
