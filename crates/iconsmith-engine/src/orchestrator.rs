use std::sync::Arc;

use chrono::Utc;
use iconsmith_contracts::errors::GenerationError;
use iconsmith_contracts::request::GenerationRequest;
use iconsmith_contracts::task::{ProgressUpdate, RemoteTaskHandle, TaskPhase, TaskSnapshot, TaskState};
use iconsmith_contracts::wire::{RemoteStatusKind, StatusResponse, SubmitRequest};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::client::ProviderClient;
use crate::context::GenerationContext;
use crate::materialize::{GenerationResult, MaterializeJob};
use crate::progress::{ProgressModel, ProgressSink};
use crate::quota::QuotaDecision;

pub type TaskResult = Result<GenerationResult, GenerationError>;

/// Cloneable handle that cancels a running task (or batch) from anywhere.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub(crate) fn from_token(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Drives one generation through quota, submit, poll and materialization.
///
/// The orchestrator is the only writer of its task state. Observers either
/// [`subscribe`](Self::subscribe) to snapshots or attach a [`ProgressSink`].
pub struct TaskOrchestrator {
    task_id: String,
    slot: Option<usize>,
    context: Arc<GenerationContext>,
    cancel: CancellationToken,
    snapshots: watch::Sender<TaskSnapshot>,
    sink: Option<Arc<dyn ProgressSink>>,
}

impl TaskOrchestrator {
    pub fn new(context: Arc<GenerationContext>) -> Self {
        let (snapshots, _) = watch::channel(TaskSnapshot::default());
        Self {
            task_id: format!("task-{}", uuid::Uuid::new_v4().simple()),
            slot: None,
            context,
            cancel: CancellationToken::new(),
            snapshots,
            sink: None,
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub(crate) fn with_slot(mut self, slot: usize) -> Self {
        self.slot = Some(slot);
        self
    }

    pub(crate) fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::from_token(self.cancel.clone())
    }

    /// Requests cancellation; takes effect at the next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.snapshots.borrow().clone()
    }

    pub async fn run(self, request: &GenerationRequest) -> TaskResult {
        let span = info_span!("generation", task_id = %self.task_id, slot = ?self.slot);
        async move {
            let mut state = TaskState::new();
            let mut progress = ProgressModel::new(self.context.progress_config().clone());
            self.publish(&state);

            let outcome = self.drive(request, &mut state, &mut progress).await;
            match &outcome {
                Ok(result) => {
                    state.raise_progress(progress.complete());
                    state.complete(result.result_ref.clone());
                    info!(
                        provider = %result.provider,
                        polls = state.polls(),
                        bytes = result.bytes.len(),
                        "generation completed"
                    );
                }
                Err(GenerationError::Cancelled) => {
                    state.cancel();
                    info!(polls = state.polls(), "generation cancelled");
                }
                Err(err) => {
                    if let Some(kind) = err.failure_kind() {
                        state.fail(kind);
                    }
                    warn!(code = err.code(), error = %err, polls = state.polls(), "generation failed");
                }
            }
            self.publish(&state);
            outcome
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        request: &GenerationRequest,
        state: &mut TaskState,
        progress: &mut ProgressModel,
    ) -> TaskResult {
        self.checkpoint()?;
        match self.context.quota().check().await? {
            QuotaDecision::Granted(quota) => {
                debug!(remaining = quota.remaining, plan = %quota.plan, "quota confirmed");
            }
            QuotaDecision::Bypassed { reason, .. } => {
                debug!(reason = %reason, "quota bypassed");
            }
        }
        self.transition(state, progress, TaskPhase::QuotaChecked);

        let prompt = self.context.composer().compose(request);
        let selection = self.context.selector().select(&request.style);
        if let Some(reason) = &selection.fallback_reason {
            debug!(provider = %selection.provider, "{reason}");
        }
        let client = self
            .context
            .client(&selection.provider)
            .ok_or_else(|| GenerationError::ProviderUnavailable(selection.provider.to_string()))?;
        let body = SubmitRequest::for_generation(request, prompt.clone(), client.model());

        self.checkpoint()?;
        let handle = client
            .submit(&body)
            .await
            .map_err(GenerationError::from_submit)?;
        info!(provider = %selection.provider, remote_task = %handle, "task submitted");
        self.transition(state, progress, TaskPhase::Submitted);

        let status = match self.poll_until_done(client.as_ref(), &handle, state, progress).await {
            Ok(status) => status,
            Err(err) => {
                if matches!(err, GenerationError::Cancelled | GenerationError::PollTimeout { .. }) {
                    self.abandon(client.as_ref(), &handle).await;
                }
                return Err(err);
            }
        };

        self.checkpoint()?;
        self.context
            .materializer()
            .materialize(
                client.as_ref(),
                MaterializeJob {
                    task_id: &self.task_id,
                    provider: &selection.provider,
                    prompt: &prompt,
                    request,
                    status: &status,
                },
            )
            .await
    }

    async fn poll_until_done(
        &self,
        client: &dyn ProviderClient,
        handle: &RemoteTaskHandle,
        state: &mut TaskState,
        progress: &mut ProgressModel,
    ) -> Result<StatusResponse, GenerationError> {
        let poll = self.context.poll_config().clone();
        let started = Instant::now();
        let mut consecutive_transient = 0u32;

        loop {
            let delay = poll.backoff.delay(poll.interval, consecutive_transient);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(GenerationError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            self.checkpoint()?;
            if state.polls() >= poll.max_polls || started.elapsed() >= poll.timeout {
                return Err(GenerationError::PollTimeout {
                    polls: state.polls(),
                    elapsed: started.elapsed(),
                });
            }

            state.record_poll(Utc::now());
            match client.status(handle).await {
                Ok(status) => {
                    consecutive_transient = 0;
                    match status.status {
                        RemoteStatusKind::Pending | RemoteStatusKind::Processing => {
                            state.advance(TaskPhase::Polling);
                            state.raise_progress(progress.on_tick(status.usable_progress()));
                            debug!(
                                poll = state.polls(),
                                progress = state.progress_fraction(),
                                "task still running"
                            );
                            self.publish(state);
                        }
                        RemoteStatusKind::Completed => {
                            if status.result_url().is_none() {
                                return Err(GenerationError::InvalidResponse(
                                    "backend reported completion without a result reference".to_string(),
                                ));
                            }
                            return Ok(status);
                        }
                        RemoteStatusKind::Failed => {
                            let reason = status
                                .error
                                .filter(|reason| !reason.trim().is_empty())
                                .unwrap_or_else(|| "unspecified backend failure".to_string());
                            return Err(GenerationError::BackendFailed { reason });
                        }
                    }
                }
                Err(err) if err.is_transient() => {
                    consecutive_transient += 1;
                    warn!(
                        error = %err,
                        consecutive = consecutive_transient,
                        "transient status error; polling again"
                    );
                    state.advance(TaskPhase::Polling);
                    state.raise_progress(progress.on_tick(None));
                    self.publish(state);
                }
                Err(err) => return Err(GenerationError::from_provider(err)),
            }
        }
    }

    async fn abandon(&self, client: &dyn ProviderClient, handle: &RemoteTaskHandle) {
        match client.cancel(handle).await {
            Ok(()) => debug!(remote_task = %handle, "remote task cancelled"),
            Err(err) => warn!(remote_task = %handle, error = %err, "remote cancel failed"),
        }
    }

    fn checkpoint(&self) -> Result<(), GenerationError> {
        if self.cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        Ok(())
    }

    fn transition(&self, state: &mut TaskState, progress: &mut ProgressModel, phase: TaskPhase) {
        if state.advance(phase) {
            state.raise_progress(progress.on_phase(phase));
            self.publish(state);
        }
    }

    fn publish(&self, state: &TaskState) {
        let snapshot = state.snapshot();
        if let Some(sink) = &self.sink {
            sink.report(&ProgressUpdate {
                task_id: self.task_id.clone(),
                slot: self.slot,
                phase: snapshot.phase,
                progress_fraction: snapshot.progress_fraction,
                phase_label: snapshot.phase_label.clone(),
                polls: snapshot.polls,
            });
        }
        self.snapshots.send_replace(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use iconsmith_contracts::errors::{FailureKind, GenerationError, ProviderError, ProviderErrorKind};
    use iconsmith_contracts::quota::PolicyOverride;
    use iconsmith_contracts::request::GenerationRequest;
    use iconsmith_contracts::task::{ProgressUpdate, TaskPhase};
    use iconsmith_contracts::wire::StatusResponse;

    use super::TaskOrchestrator;
    use crate::client::{ProviderClient, ProviderClientRegistry};
    use crate::config::{BackoffPolicy, PollConfig};
    use crate::context::GenerationContext;
    use crate::progress::ProgressSink;
    use crate::quota::QuotaGate;
    use crate::testing::{context_with, ScriptedClient};

    fn recorder() -> (Arc<Mutex<Vec<ProgressUpdate>>>, Arc<dyn ProgressSink>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        let sink = move |update: &ProgressUpdate| {
            if let Ok(mut seen) = captured.lock() {
                seen.push(update.clone());
            }
        };
        (seen, Arc::new(sink))
    }

    fn updates(seen: &Arc<Mutex<Vec<ProgressUpdate>>>) -> Vec<ProgressUpdate> {
        seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }

    #[tokio::test(start_paused = true)]
    async fn gear_icon_completes_after_two_pending_polls() -> anyhow::Result<()> {
        let client = Arc::new(
            ScriptedClient::new("openai")
                .with_remaining(5)
                .with_statuses([
                    Ok(StatusResponse::pending("openai-1", Some(0.1))),
                    Ok(StatusResponse::pending("openai-1", Some(0.1))),
                    Ok(StatusResponse::completed("openai-1", "https://x/img.png")),
                ]),
        );
        let context = context_with(&[Arc::clone(&client)]).into_shared();
        let (seen, sink) = recorder();
        let orchestrator = TaskOrchestrator::new(context).with_sink(sink);
        let snapshots = orchestrator.subscribe();

        let result = orchestrator
            .run(&GenerationRequest::new("gear icon").with_style("flat"))
            .await?;

        assert!(!result.bytes.is_empty());
        assert_eq!(result.result_ref.as_str(), "https://x/img.png");
        assert_eq!(client.submit_calls(), 1);
        assert_eq!(client.status_calls(), 3);

        let last = snapshots.borrow().clone();
        assert_eq!(last.phase, TaskPhase::Completed);
        assert_eq!(last.progress_fraction, 1.0);
        assert_eq!(last.polls, 3);

        let updates = updates(&seen);
        let fractions: Vec<f64> = updates.iter().map(|update| update.progress_fraction).collect();
        assert!(fractions.windows(2).all(|pair| pair[0] <= pair[1]), "{fractions:?}");
        assert_eq!(
            updates.iter().filter(|update| update.phase.is_terminal()).count(),
            1
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_quota_never_submits() {
        let client = Arc::new(ScriptedClient::new("openai").with_remaining(0));
        let orchestrator = TaskOrchestrator::new(context_with(&[Arc::clone(&client)]).into_shared());
        let snapshots = orchestrator.subscribe();

        let err = orchestrator.run(&GenerationRequest::new("gear")).await.err();

        assert!(matches!(err, Some(GenerationError::QuotaExceeded { .. })));
        assert_eq!(client.submit_calls(), 0);
        let last = snapshots.borrow().clone();
        assert_eq!(last.phase, TaskPhase::Failed);
        assert_eq!(last.failure_reason, Some(FailureKind::QuotaExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn bypass_policy_submits_without_quota() -> anyhow::Result<()> {
        let client = Arc::new(ScriptedClient::new("openai").with_remaining(0));
        let mut registry = ProviderClientRegistry::new();
        registry.register_arc(Arc::clone(&client) as Arc<dyn ProviderClient>);
        let context = GenerationContext::new(
            registry,
            QuotaGate::new(
                Arc::clone(&client) as Arc<dyn ProviderClient>,
                PolicyOverride::bypass_quota("simulator"),
            ),
        );
        TaskOrchestrator::new(context.into_shared())
            .run(&GenerationRequest::new("gear"))
            .await?;
        assert_eq!(client.submit_calls(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn submit_rejection_is_terminal() {
        let client = Arc::new(ScriptedClient::new("openai").with_submit_error(ProviderError::new(
            ProviderErrorKind::ServerError(400),
            "prompt rejected",
        )));
        let err = TaskOrchestrator::new(context_with(&[Arc::clone(&client)]).into_shared())
            .run(&GenerationRequest::new("gear"))
            .await
            .err();
        assert_eq!(err.map(|err| err.code()), Some("submit_failed"));
        assert_eq!(client.status_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unrouted_provider_is_unavailable() {
        let client = Arc::new(ScriptedClient::new("openai"));
        let orchestrator = TaskOrchestrator::new(context_with(&[Arc::clone(&client)]).into_shared());
        let err = orchestrator
            .run(&GenerationRequest::new("gear").with_style("3d"))
            .await
            .err();
        assert_eq!(err, Some(GenerationError::ProviderUnavailable("flux".to_string())));
        assert_eq!(client.submit_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_wait_stops_polling() -> anyhow::Result<()> {
        let client = Arc::new(ScriptedClient::new("openai").pending_forever());
        let orchestrator = TaskOrchestrator::new(context_with(&[Arc::clone(&client)]).into_shared());
        let cancel = orchestrator.cancel_handle();
        let snapshots = orchestrator.subscribe();
        let request = GenerationRequest::new("gear");
        let running = tokio::spawn(async move { orchestrator.run(&request).await });

        tokio::time::sleep(Duration::from_millis(350 * 2 + 100)).await;
        let polls_before = client.status_calls();
        assert_eq!(polls_before, 2);
        cancel.cancel();

        let outcome = running.await?;
        assert_eq!(outcome.err(), Some(GenerationError::Cancelled));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(client.status_calls(), polls_before);
        assert_eq!(client.cancel_calls(), 1);
        let last = snapshots.borrow().clone();
        assert_eq!(last.phase, TaskPhase::Cancelled);
        assert_eq!(last.failure_reason, None);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_status_call_lets_it_finish_then_stops() -> anyhow::Result<()> {
        let client = Arc::new(
            ScriptedClient::new("openai")
                .pending_forever()
                .with_status_delay(Duration::from_secs(1)),
        );
        let orchestrator = TaskOrchestrator::new(context_with(&[Arc::clone(&client)]).into_shared());
        let cancel = orchestrator.cancel_handle();
        let request = GenerationRequest::new("gear");
        let running = tokio::spawn(async move { orchestrator.run(&request).await });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(client.status_calls(), 1);
        cancel.cancel();

        assert_eq!(running.await?.err(), Some(GenerationError::Cancelled));
        assert_eq!(client.status_calls(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_does_nothing_remote() {
        let client = Arc::new(ScriptedClient::new("openai"));
        let orchestrator = TaskOrchestrator::new(context_with(&[Arc::clone(&client)]).into_shared());
        orchestrator.cancel();
        let err = orchestrator.run(&GenerationRequest::new("gear")).await.err();
        assert_eq!(err, Some(GenerationError::Cancelled));
        assert_eq!(client.submit_calls(), 0);
        assert_eq!(client.cancel_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn endless_pending_times_out_after_poll_budget() {
        let client = Arc::new(ScriptedClient::new("openai").pending_forever());
        let context = context_with(&[Arc::clone(&client)])
            .with_poll_config(PollConfig {
                interval: Duration::from_millis(350),
                max_polls: 5,
                timeout: Duration::from_secs(120),
                backoff: BackoffPolicy::Fixed,
            })
            .into_shared();
        let orchestrator = TaskOrchestrator::new(context);
        let snapshots = orchestrator.subscribe();

        let err = orchestrator.run(&GenerationRequest::new("gear")).await.err();

        assert!(matches!(err, Some(GenerationError::PollTimeout { polls: 5, .. })));
        assert_eq!(client.status_calls(), 5);
        assert_eq!(client.cancel_calls(), 1);
        let last = snapshots.borrow().clone();
        assert_eq!(last.failure_reason, Some(FailureKind::PollTimeout));
        assert!(last.progress_fraction < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn wall_clock_budget_also_times_out() {
        let client = Arc::new(
            ScriptedClient::new("openai")
                .pending_forever()
                .with_status_delay(Duration::from_secs(4)),
        );
        let context = context_with(&[Arc::clone(&client)])
            .with_poll_config(PollConfig {
                interval: Duration::from_millis(350),
                max_polls: 1_000,
                timeout: Duration::from_secs(10),
                backoff: BackoffPolicy::Fixed,
            })
            .into_shared();
        let err = TaskOrchestrator::new(context)
            .run(&GenerationRequest::new("gear"))
            .await
            .err();
        assert!(matches!(err, Some(GenerationError::PollTimeout { polls: 3, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_absorbed() -> anyhow::Result<()> {
        let client = Arc::new(ScriptedClient::new("openai").with_statuses([
            Err(ProviderError::new(ProviderErrorKind::RateLimited, "slow down")),
            Err(ProviderError::new(ProviderErrorKind::ServerError(503), "busy")),
            Err(ProviderError::network("reset")),
            Ok(StatusResponse::completed("openai-1", "https://x/img.png")),
        ]));
        let context = context_with(&[Arc::clone(&client)])
            .with_poll_config(PollConfig {
                backoff: BackoffPolicy::exponential(),
                ..PollConfig::default()
            })
            .into_shared();
        let result = TaskOrchestrator::new(context)
            .run(&GenerationRequest::new("gear"))
            .await?;
        assert_eq!(result.width, 8);
        assert_eq!(client.status_calls(), 4);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_status_is_terminal() {
        let client = Arc::new(ScriptedClient::new("openai").with_statuses([Err(ProviderError::new(
            ProviderErrorKind::Unauthorized,
            "key revoked",
        ))]));
        let err = TaskOrchestrator::new(context_with(&[Arc::clone(&client)]).into_shared())
            .run(&GenerationRequest::new("gear"))
            .await
            .err();
        assert_eq!(err.map(|err| err.code()), Some("unauthorized"));
        assert_eq!(client.status_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backend_failure_carries_reason() {
        let client = Arc::new(ScriptedClient::new("openai").with_statuses([
            Ok(StatusResponse::pending("openai-1", Some(0.4))),
            Ok(StatusResponse::failed("openai-1", "content policy violation")),
        ]));
        let err = TaskOrchestrator::new(context_with(&[Arc::clone(&client)]).into_shared())
            .run(&GenerationRequest::new("gear"))
            .await
            .err();
        assert_eq!(
            err,
            Some(GenerationError::BackendFailed {
                reason: "content policy violation".to_string()
            })
        );
        assert_eq!(client.cancel_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_without_result_is_invalid() {
        let mut completed = StatusResponse::completed("openai-1", "");
        completed.result_url = Some("   ".to_string());
        let client = Arc::new(ScriptedClient::new("openai").with_statuses([Ok(completed)]));
        let err = TaskOrchestrator::new(context_with(&[Arc::clone(&client)]).into_shared())
            .run(&GenerationRequest::new("gear"))
            .await
            .err();
        assert!(matches!(err, Some(GenerationError::InvalidResponse(_))));
        assert_eq!(client.fetch_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn download_failure_fails_the_task() {
        let client = Arc::new(ScriptedClient::new("openai").with_fetch(Err(ProviderError::new(
            ProviderErrorKind::ServerError(404),
            "expired",
        ))));
        let orchestrator = TaskOrchestrator::new(context_with(&[Arc::clone(&client)]).into_shared());
        let snapshots = orchestrator.subscribe();
        let err = orchestrator.run(&GenerationRequest::new("gear")).await.err();
        assert_eq!(err.map(|err| err.code()), Some("backend_failed"));
        assert_eq!(snapshots.borrow().phase, TaskPhase::Failed);
    }
}
