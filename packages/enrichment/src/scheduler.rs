//! Bounded worker pool over a batch of rows.
//!
//! Workers pull the next undispatched row from a shared cursor, so at most
//! `concurrency` rows are in flight and every row is dispatched at most once.
//! Results are collected in arrival order; the assembler restores input
//! order later.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{PipelineError, Result};
use crate::processor::RowProcessor;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::types::plan::AnalysisPlan;
use crate::types::result::RowResult;
use crate::types::row::Row;

/// Counters for one batch at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub total: usize,
    pub completed: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub cancelled: bool,
}

impl BatchSnapshot {
    fn progress_event(&self) -> ProgressEvent {
        ProgressEvent {
            current: self.completed,
            total: self.total,
            success_count: self.success_count,
            error_count: self.error_count,
        }
    }
}

/// Shared batch counters.
///
/// All counters change under one lock, so `success_count + error_count ==
/// completed` holds for every snapshot.
#[derive(Debug)]
pub struct BatchState {
    inner: Mutex<BatchSnapshot>,
}

impl BatchState {
    pub fn new(total: usize) -> Self {
        Self {
            inner: Mutex::new(BatchSnapshot {
                total,
                ..Default::default()
            }),
        }
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        *self.lock()
    }

    /// Count one finished row and publish progress while still holding the
    /// lock, so sinks observe events in order.
    fn record(&self, is_error: bool, sink: &dyn ProgressSink) {
        let mut state = self.lock();
        state.completed += 1;
        if is_error {
            state.error_count += 1;
        } else {
            state.success_count += 1;
        }
        sink.on_progress(state.progress_event());
    }

    fn mark_cancelled(&self) {
        self.lock().cancelled = true;
    }

    fn lock(&self) -> MutexGuard<'_, BatchSnapshot> {
        // Counters stay consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Output of one scheduler run.
#[derive(Debug, Clone)]
pub struct BatchRun {
    /// In arrival order
    pub results: Vec<RowResult>,
    pub state: BatchSnapshot,
}

/// Runs a [`RowProcessor`] over many rows with bounded parallelism.
#[derive(Clone)]
pub struct BatchScheduler {
    processor: RowProcessor,
}

impl BatchScheduler {
    pub fn new(processor: RowProcessor) -> Self {
        Self { processor }
    }

    /// Process `rows` with `concurrency` workers.
    ///
    /// Cancellation is checked before each dispatch and at every wait inside
    /// a row. Rows that finish are kept; rows interrupted while waiting for a
    /// permit or a retry are dropped uncounted. The snapshot is marked
    /// `cancelled` whenever cancellation left rows unfinished. A panicking
    /// worker aborts the batch with [`PipelineError::BatchAbort`].
    pub async fn run(
        &self,
        rows: Arc<Vec<Row>>,
        plan: Arc<AnalysisPlan>,
        concurrency: usize,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<BatchRun> {
        let total = rows.len();
        let state = Arc::new(BatchState::new(total));
        let workers = concurrency.max(1).min(total);

        info!(total, workers, "Batch starting");

        if total == 0 {
            return Ok(BatchRun {
                results: Vec::new(),
                state: state.snapshot(),
            });
        }

        let cursor = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel::<RowResult>();
        let mut join_set = JoinSet::new();

        for worker_id in 0..workers {
            let rows = rows.clone();
            let plan = plan.clone();
            let cursor = cursor.clone();
            let state = state.clone();
            let progress = progress.clone();
            let cancel = cancel.clone();
            let tx = tx.clone();
            let processor = self.processor.clone();

            join_set.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        debug!(worker_id, "Worker stopping on cancellation");
                        break;
                    }

                    let index = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(row) = rows.get(index) else {
                        break;
                    };

                    let Some(result) = processor.process(row, &plan, &cancel).await else {
                        debug!(worker_id, row = %row.id(), "Row abandoned on cancellation");
                        break;
                    };
                    let is_error = result.is_error();
                    if tx.send(result).is_err() {
                        break;
                    }
                    state.record(is_error, progress.as_ref());
                }
            });
        }
        drop(tx);

        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task failed");
                join_set.abort_all();
                return Err(PipelineError::BatchAbort(format!("worker task failed: {}", e)));
            }
        }

        let mut results = Vec::with_capacity(total);
        while let Some(result) = rx.recv().await {
            results.push(result);
        }

        if cancel.is_cancelled() && state.snapshot().completed < total {
            state.mark_cancelled();
        }

        let snapshot = state.snapshot();
        info!(
            total = snapshot.total,
            completed = snapshot.completed,
            success = snapshot.success_count,
            errors = snapshot.error_count,
            cancelled = snapshot.cancelled,
            "Batch finished"
        );

        Ok(BatchRun {
            results,
            state: snapshot,
        })
    }
}
