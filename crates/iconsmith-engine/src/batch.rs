use std::sync::{Arc, Mutex};

use iconsmith_contracts::errors::GenerationError;
use iconsmith_contracts::request::GenerationRequest;
use iconsmith_contracts::task::ProgressUpdate;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

use crate::config::BatchMode;
use crate::context::GenerationContext;
use crate::orchestrator::{CancelHandle, TaskOrchestrator, TaskResult};
use crate::progress::ProgressSink;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BatchSummary {
    pub fn from_results(results: &[TaskResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Self::default()
        };
        for result in results {
            match result {
                Ok(_) => summary.succeeded += 1,
                Err(GenerationError::Cancelled) => summary.cancelled += 1,
                Err(_) => summary.failed += 1,
            }
        }
        summary
    }
}

/// Runs N generations and reports one aggregate progress value.
///
/// Results come back in request order, one per request, whether or not a slot
/// succeeded. Cancelling the batch cancels every running slot and skips the rest.
/// A cancel applies to the batch in flight (or the next one if none is running);
/// once a batch has ended cancelled the coordinator is armed again.
pub struct BatchCoordinator {
    batch_id: String,
    context: Arc<GenerationContext>,
    mode: BatchMode,
    cancel: Mutex<CancellationToken>,
    sink: Option<Arc<dyn ProgressSink>>,
    task_sink: Option<Arc<dyn ProgressSink>>,
    aggregate: Arc<watch::Sender<f64>>,
}

impl BatchCoordinator {
    pub fn new(context: Arc<GenerationContext>) -> Self {
        let mode = context.batch_mode();
        let (aggregate, _) = watch::channel(0.0);
        Self {
            batch_id: format!("batch-{}", uuid::Uuid::new_v4().simple()),
            context,
            mode,
            cancel: Mutex::new(CancellationToken::new()),
            sink: None,
            task_sink: None,
            aggregate: Arc::new(aggregate),
        }
    }

    pub fn with_mode(mut self, mode: BatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Receives every per-slot update; `progress_fraction` is rewritten to the batch aggregate.
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Receives each slot's own updates unchanged (per-task ids and fractions).
    pub fn with_task_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.task_sink = Some(sink);
        self
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::from_token(self.current_token())
    }

    pub fn cancel(&self) {
        self.current_token().cancel();
    }

    fn current_token(&self) -> CancellationToken {
        match self.cancel.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swaps in a fresh token if `spent` is still the armed one.
    fn rearm(&self, spent: &CancellationToken) {
        let mut token = match self.cancel.lock() {
            Ok(token) => token,
            Err(poisoned) => poisoned.into_inner(),
        };
        if token.is_cancelled() && spent.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<f64> {
        self.aggregate.subscribe()
    }

    pub async fn run_batch(&self, requests: &[GenerationRequest]) -> Vec<TaskResult> {
        let span = info_span!("batch", batch_id = %self.batch_id, size = requests.len());
        async move {
            if requests.is_empty() {
                return Vec::new();
            }
            let cancel = self.current_token();
            let tracker = Arc::new(BatchTracker::new(
                self.batch_id.clone(),
                requests.len(),
                self.sink.clone(),
                self.task_sink.clone(),
                Arc::clone(&self.aggregate),
            ));
            let results = match self.mode {
                BatchMode::Sequential => self.run_sequential(requests, &tracker, &cancel).await,
                BatchMode::Concurrent { max_parallel } => {
                    self.run_concurrent(requests, &tracker, &cancel, max_parallel.max(1))
                        .await
                }
            };
            self.rearm(&cancel);
            let summary = BatchSummary::from_results(&results);
            info!(
                succeeded = summary.succeeded,
                failed = summary.failed,
                cancelled = summary.cancelled,
                "batch finished"
            );
            results
        }
        .instrument(span)
        .await
    }

    async fn run_sequential(
        &self,
        requests: &[GenerationRequest],
        tracker: &Arc<BatchTracker>,
        cancel: &CancellationToken,
    ) -> Vec<TaskResult> {
        let mut results = Vec::with_capacity(requests.len());
        for (slot, request) in requests.iter().enumerate() {
            if cancel.is_cancelled() {
                results.push(Err(GenerationError::Cancelled));
                continue;
            }
            let orchestrator = self.orchestrator(slot, tracker, cancel);
            results.push(orchestrator.run(request).await);
        }
        results
    }

    async fn run_concurrent(
        &self,
        requests: &[GenerationRequest],
        tracker: &Arc<BatchTracker>,
        cancel: &CancellationToken,
        max_parallel: usize,
    ) -> Vec<TaskResult> {
        let permits = Arc::new(Semaphore::new(max_parallel));
        let mut tasks = JoinSet::new();
        for (slot, request) in requests.iter().enumerate() {
            let orchestrator = self.orchestrator(slot, tracker, cancel);
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();
            let request = request.clone();
            tasks.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = permits.acquire_owned() => permit.ok(),
                };
                let result = match permit {
                    Some(_permit) => orchestrator.run(&request).await,
                    None => Err(GenerationError::Cancelled),
                };
                (slot, result)
            });
        }

        let mut results: Vec<Option<TaskResult>> = (0..requests.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, result)) => results[slot] = Some(result),
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(_) => {}
            }
        }
        results
            .into_iter()
            .map(|result| result.unwrap_or(Err(GenerationError::Cancelled)))
            .collect()
    }

    fn orchestrator(
        &self,
        slot: usize,
        tracker: &Arc<BatchTracker>,
        cancel: &CancellationToken,
    ) -> TaskOrchestrator {
        TaskOrchestrator::new(Arc::clone(&self.context))
            .with_task_id(format!("{}-{slot}", self.batch_id))
            .with_slot(slot)
            .with_cancel_token(cancel.child_token())
            .with_sink(Arc::clone(tracker) as Arc<dyn ProgressSink>)
    }
}

/// Folds per-slot progress into `sum(slot fractions) / n`, finished slots counting as 1.0.
struct BatchTracker {
    batch_id: String,
    slots: Mutex<Vec<f64>>,
    sink: Option<Arc<dyn ProgressSink>>,
    task_sink: Option<Arc<dyn ProgressSink>>,
    aggregate: Arc<watch::Sender<f64>>,
}

impl BatchTracker {
    fn new(
        batch_id: String,
        size: usize,
        sink: Option<Arc<dyn ProgressSink>>,
        task_sink: Option<Arc<dyn ProgressSink>>,
        aggregate: Arc<watch::Sender<f64>>,
    ) -> Self {
        aggregate.send_replace(0.0);
        Self {
            batch_id,
            slots: Mutex::new(vec![0.0; size]),
            sink,
            task_sink,
            aggregate,
        }
    }
}

impl ProgressSink for BatchTracker {
    fn report(&self, update: &ProgressUpdate) {
        if let Some(task_sink) = &self.task_sink {
            task_sink.report(update);
        }
        let Some(slot) = update.slot else {
            return;
        };
        let fraction = {
            let Ok(mut slots) = self.slots.lock() else {
                return;
            };
            let Some(entry) = slots.get_mut(slot) else {
                return;
            };
            let local = if update.phase.is_terminal() {
                1.0
            } else {
                update.progress_fraction
            };
            *entry = entry.max(local);
            slots.iter().sum::<f64>() / slots.len() as f64
        };
        let mut reported = fraction;
        self.aggregate.send_modify(|current| {
            if fraction > *current {
                *current = fraction;
            }
            reported = *current;
        });
        if let Some(sink) = &self.sink {
            let mut batch_update = update.clone();
            batch_update.task_id = self.batch_id.clone();
            batch_update.progress_fraction = reported;
            sink.report(&batch_update);
        }
    }
}
