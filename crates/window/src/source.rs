//! Source-phase task scheduling and the per-worker drive loop.
//!
//! The scheduler enumerates `(stage, group, block-range)` tasks once, ordered
//! by descending group size and by stage within each group. A worker may only
//! take the next task when the task's stage matches its group's current stage;
//! otherwise the cursor stays put and the worker parks on the blocked-task
//! queue until another worker makes progress.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use arrow::array::ArrayRef;
use arrow::record_batch::RecordBatch;
use tracing::{debug, trace};
use wf_common::{global_metrics, Result, WfError};

use crate::block::BlockScanner;
use crate::executor::ExecutorState;
use crate::group::{GroupStage, WindowHashGroup};
use crate::operator::WindowGlobalSink;

/// One unit of source work: a block range of one group at one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    /// Stage this task runs.
    pub stage: GroupStage,
    /// Index of the hash group.
    pub group_idx: usize,
    /// First block (inclusive); advanced by the worker as it consumes blocks.
    pub begin_idx: usize,
    /// Last block (exclusive).
    pub end_idx: usize,
    /// Block count of the whole group.
    pub max_idx: usize,
}

/// Outcome of asking the scheduler for work.
#[derive(Debug)]
pub enum TaskPoll {
    /// A task whose stage matches its group's stage.
    Task(Task),
    /// All tasks dispensed (or the source was stopped).
    Finished,
    /// The next task's group is not ready for that stage yet.
    Blocked,
}

/// Wakeup handle a blocked worker parks on.
///
/// `callback` is invoked by whichever worker flushes the blocked queue; the
/// parked worker returns from `wait` and re-polls.
#[derive(Clone, Default)]
pub struct InterruptSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl InterruptSignal {
    /// Fresh, un-signaled handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the parked worker.
    pub fn callback(&self) {
        let (woken, cv) = &*self.inner;
        if let Ok(mut woken) = woken.lock() {
            *woken = true;
        }
        cv.notify_all();
    }

    /// Park until woken or until `timeout` elapses. Returns whether the
    /// callback fired. The timeout bounds the wait so a missed wakeup can
    /// never wedge a worker.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (woken, cv) = &*self.inner;
        let Ok(mut guard) = woken.lock() else {
            return false;
        };
        if !*guard {
            let (g, _) = cv
                .wait_timeout(guard, timeout)
                .unwrap_or_else(|e| e.into_inner());
            guard = g;
        }
        let fired = *guard;
        *guard = false;
        fired
    }
}

/// Shared source state: the task list, its cursor, and the blocked queue.
pub struct WindowSourceState {
    gsink: Arc<WindowGlobalSink>,
    tasks: Vec<Task>,
    next_task: Mutex<usize>,
    /// Stop producing tasks; set on error or cancellation.
    pub stopped: AtomicBool,
    /// Rows returned so far, for progress reporting.
    pub returned: AtomicUsize,
    blocked: Mutex<Vec<InterruptSignal>>,
}

impl WindowSourceState {
    /// Enumerate all tasks.
    ///
    /// Groups get their `batch_base` assigned here (cumulative block counts,
    /// empties skipped), are ordered largest first, and each contributes
    /// SINK, FINALIZE and GETDATA tasks strided so the largest group spreads
    /// across every worker thread.
    pub fn new(gsink: Arc<WindowGlobalSink>, threads: usize) -> Result<Self> {
        let groups = gsink.groups_snapshot();

        let mut batch_base = 0_usize;
        let mut partition_blocks: Vec<(usize, usize)> = Vec::new();
        for (group_idx, group) in groups.iter().enumerate() {
            let Some(group) = group else { continue };
            if group.blocks == 0 {
                continue;
            }
            group.batch_base.store(batch_base, Ordering::SeqCst);
            batch_base += group.blocks;
            partition_blocks.push((group.blocks, group_idx));
        }
        // Largest groups first so they overlap the most workers.
        partition_blocks.sort_unstable_by(|a, b| b.cmp(a));

        let mut tasks = Vec::new();
        if let Some(&(max_blocks, _)) = partition_blocks.first() {
            let threads = threads.max(1);
            let per_thread = max_blocks.div_ceil(threads);
            let stages = [GroupStage::Sink, GroupStage::Finalize, GroupStage::GetData];
            for &(blocks, group_idx) in &partition_blocks {
                for stage in stages {
                    let mut begin_idx = 0;
                    while begin_idx < blocks {
                        let end_idx = (begin_idx + per_thread).min(blocks);
                        tasks.push(Task {
                            stage,
                            group_idx,
                            begin_idx,
                            end_idx,
                            max_idx: blocks,
                        });
                        if let Some(group) = &groups[group_idx] {
                            group.tasks_remaining.fetch_add(1, Ordering::SeqCst);
                        }
                        begin_idx = end_idx;
                    }
                }
            }
        }
        global_metrics().set_scheduler_queued_tasks("Window", tasks.len() as i64);
        debug!(
            tasks = tasks.len(),
            groups = partition_blocks.len(),
            "window source tasks enumerated"
        );

        Ok(Self {
            gsink,
            tasks,
            next_task: Mutex::new(0),
            stopped: AtomicBool::new(false),
            returned: AtomicUsize::new(0),
            blocked: Mutex::new(Vec::new()),
        })
    }

    /// The operator gains nothing from more workers than tasks.
    pub fn max_threads(&self) -> usize {
        self.tasks.len()
    }

    /// Shared sink state (executors, groups, output schema).
    pub fn gsink(&self) -> &Arc<WindowGlobalSink> {
        &self.gsink
    }

    fn group(&self, group_idx: usize) -> Result<Arc<WindowHashGroup>> {
        self.gsink
            .group(group_idx)
            .ok_or_else(|| WfError::Internal(format!("hash group {group_idx} already released")))
    }

    /// Hand out the next task iff its stage matches its group's stage.
    ///
    /// The compound check-and-advance happens under one lock; everything the
    /// check reads is an atomic, so hold time stays O(1).
    pub fn try_next_task(&self) -> Result<TaskPoll> {
        let mut next_task = self
            .next_task
            .lock()
            .map_err(|_| WfError::Internal("scheduler lock poisoned".to_string()))?;
        if *next_task >= self.tasks.len() || self.stopped.load(Ordering::SeqCst) {
            return Ok(TaskPoll::Finished);
        }
        let task = self.tasks[*next_task];
        let group = self.group(task.group_idx)?;
        if task.stage == group.stage() {
            *next_task += 1;
            return Ok(TaskPoll::Task(task));
        }
        Ok(TaskPoll::Blocked)
    }

    /// Mark one task finished; the last task of a group releases its memory.
    pub fn finish_task(&self, task: Task) -> Result<()> {
        let group = self.group(task.group_idx)?;
        if group.tasks_remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            debug_assert_eq!(group.sunk.load(Ordering::SeqCst), group.count);
            debug_assert_eq!(group.finalized.load(Ordering::SeqCst), group.blocks);
            if let Some(group) = self.gsink.take_group(task.group_idx) {
                group.release();
            }
        }
        Ok(())
    }

    /// Blocked-queue maintenance. A blocked worker enqueues its interrupt;
    /// any worker that makes progress flushes the whole queue.
    pub fn update_blocked_tasks(&self, blocked: bool, signal: &InterruptSignal) -> bool {
        let Ok(mut queue) = self.blocked.lock() else {
            return blocked;
        };
        if blocked {
            trace!("window worker blocked");
            queue.push(signal.clone());
        } else {
            for waiter in queue.drain(..) {
                waiter.callback();
            }
        }
        global_metrics().set_scheduler_blocked_tasks("Window", queue.len() as i64);
        blocked
    }

    /// Wake every parked worker without handing out tasks.
    pub fn unblock_all(&self) {
        if let Ok(mut queue) = self.blocked.lock() {
            for waiter in queue.drain(..) {
                waiter.callback();
            }
            global_metrics().set_scheduler_blocked_tasks("Window", 0);
        }
    }

    /// Stop producing tasks and wake every parked worker.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.unblock_all();
    }

    /// Whether the source has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// What one `get_data` poll produced.
#[derive(Debug)]
pub enum WorkerPoll {
    /// An output batch.
    Batch(RecordBatch),
    /// No schedulable task; park on the interrupt and retry.
    Blocked,
    /// All work done.
    Finished,
}

/// Per-worker drive state: current task, group, scanner, and executor states.
pub struct WindowWorkerState {
    gsource: Arc<WindowSourceState>,
    /// Batch index of the batch most recently emitted, for ordered merging.
    pub batch_index: usize,
    task: Option<Task>,
    group: Option<Arc<WindowHashGroup>>,
    gestates: Vec<Arc<dyn ExecutorState>>,
    local_states: Vec<Box<dyn ExecutorState>>,
    scanner: Option<BlockScanner>,
}

impl WindowWorkerState {
    /// New worker bound to the shared source state.
    pub fn new(gsource: Arc<WindowSourceState>) -> Self {
        Self {
            gsource,
            batch_index: 0,
            task: None,
            group: None,
            gestates: Vec::new(),
            local_states: Vec::new(),
            scanner: None,
        }
    }

    /// Drive the worker one step: acquire tasks, run SINK/FINALIZE ranges,
    /// and emit one output batch per GETDATA block scan.
    pub fn get_data(&mut self) -> Result<WorkerPoll> {
        // Done with the current evaluate block?
        if let Some(scanner) = &self.scanner {
            if scanner.remaining() == 0 {
                self.scanner = None;
                if let Some(task) = &mut self.task {
                    task.begin_idx += 1;
                }
            }
        }

        // Acquire until we hold an in-progress GETDATA range.
        while self
            .task
            .map_or(true, |t| t.begin_idx >= t.end_idx || t.stage != GroupStage::GetData)
        {
            let prev = self.task.take();
            match self.gsource.try_next_task()? {
                TaskPoll::Blocked => {
                    self.finish_hash_group(prev)?;
                    return Ok(WorkerPoll::Blocked);
                }
                TaskPoll::Finished => {
                    self.finish_hash_group(prev)?;
                    return Ok(WorkerPoll::Finished);
                }
                TaskPoll::Task(task) => {
                    let new_group =
                        prev.map_or(true, |p| p.group_idx != task.group_idx);
                    self.task = Some(task);
                    if new_group {
                        self.finish_hash_group(prev)?;
                        self.begin_hash_group()?;
                    } else if let Some(prev) = prev {
                        self.gsource.finish_task(prev)?;
                    }
                    match task.stage {
                        GroupStage::Sink => self.sink()?,
                        GroupStage::Finalize => self.finalize()?,
                        GroupStage::GetData => break,
                        GroupStage::Done => {
                            return Err(WfError::Internal(
                                "task dispatched against a released group".to_string(),
                            ));
                        }
                    }
                }
            }
        }

        self.emit().map(WorkerPoll::Batch)
    }

    /// Construct executor global states (one-shot, group level) and this
    /// worker's local states.
    fn begin_hash_group(&mut self) -> Result<()> {
        let Some(task) = self.task else {
            return Ok(());
        };
        let group = self.gsource.group(task.group_idx)?;
        let executors = &self.gsource.gsink.executors;
        let gestates = group.initialize(executors)?;
        let local_states = executors
            .iter()
            .zip(&gestates)
            .map(|(executor, gstate)| executor.local_state(gstate.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        self.group = Some(group);
        self.gestates = gestates;
        self.local_states = local_states;
        Ok(())
    }

    /// Drop this worker's per-group resources and finish the completed task.
    fn finish_hash_group(&mut self, prev: Option<Task>) -> Result<()> {
        self.scanner = None;
        self.local_states.clear();
        self.gestates.clear();
        self.group = None;
        if let Some(prev) = prev {
            self.gsource.finish_task(prev)?;
        }
        Ok(())
    }

    fn current_group(&self) -> Result<&Arc<WindowHashGroup>> {
        self.group
            .as_ref()
            .ok_or_else(|| WfError::Internal("worker has no active hash group".to_string()))
    }

    /// First pass over the task's blocks without flushing; every executor
    /// sees every row once.
    fn sink(&mut self) -> Result<()> {
        let Some(mut task) = self.task else {
            return Err(WfError::Internal("sink without a task".to_string()));
        };
        let group = Arc::clone(self.current_group()?);
        let executors = &self.gsource.gsink.executors;
        while task.begin_idx < task.end_idx {
            let mut scanner = group.build_scanner(task.begin_idx)?;
            loop {
                let input_idx = scanner.scanned();
                let Some(input) = scanner.scan() else {
                    break;
                };
                for (w, executor) in executors.iter().enumerate() {
                    executor.sink(
                        &input,
                        input_idx,
                        group.count,
                        self.gestates[w].as_ref(),
                        self.local_states[w].as_mut(),
                    )?;
                }
                group.add_sunk(input.num_rows())?;
            }
            task.begin_idx += 1;
        }
        self.task = Some(task);
        Ok(())
    }

    /// Finalize every executor for this block range. The executors make the
    /// build idempotent, so concurrent ranges of one group are safe.
    fn finalize(&mut self) -> Result<()> {
        let Some(mut task) = self.task else {
            return Err(WfError::Internal("finalize without a task".to_string()));
        };
        let group = Arc::clone(self.current_group()?);
        let executors = &self.gsource.gsink.executors;
        for (w, executor) in executors.iter().enumerate() {
            executor.finalize(self.gestates[w].as_ref(), self.local_states[w].as_mut())?;
        }
        group.add_finalized(task.end_idx - task.begin_idx)?;
        task.begin_idx = task.end_idx;
        self.task = Some(task);
        Ok(())
    }

    /// Evaluate one block: scan it (flushing), run every executor, and build
    /// the output batch as input columns plus executor output columns.
    fn emit(&mut self) -> Result<RecordBatch> {
        let task = self
            .task
            .ok_or_else(|| WfError::Internal("emit without a task".to_string()))?;
        let group = Arc::clone(self.current_group()?);
        if self.scanner.is_none() {
            self.scanner = Some(group.evaluate_scanner(task.begin_idx)?);
            self.batch_index = group.batch_base.load(Ordering::SeqCst) + task.begin_idx;
        }
        let scanner = self
            .scanner
            .as_mut()
            .ok_or_else(|| WfError::Internal("evaluate scanner missing".to_string()))?;
        let position = scanner.scanned();
        let input = scanner
            .scan()
            .ok_or_else(|| WfError::Internal("evaluate scan of exhausted block".to_string()))?;

        let executors = &self.gsource.gsink.executors;
        let mut columns: Vec<ArrayRef> = input.columns().to_vec();
        for (w, executor) in executors.iter().enumerate() {
            columns.push(executor.evaluate(
                position,
                &input,
                self.gestates[w].as_ref(),
                self.local_states[w].as_mut(),
            )?);
        }
        RecordBatch::try_new(self.gsource.gsink.output_schema.clone(), columns)
            .map_err(|e| WfError::Execution(format!("window output batch failed: {e}")))
    }
}
