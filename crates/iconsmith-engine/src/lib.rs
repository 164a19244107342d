pub mod batch;
pub mod client;
pub mod config;
pub mod context;
pub mod materialize;
pub mod orchestrator;
pub mod progress;
pub mod quota;

#[cfg(test)]
mod testing;

pub use batch::{BatchCoordinator, BatchSummary};
pub use client::{DryrunClient, HttpTaskClient, ProviderClient, ProviderClientRegistry};
pub use config::{BackoffPolicy, BatchMode, EngineConfig, PollConfig, ProgressConfig};
pub use context::GenerationContext;
pub use materialize::{GenerationResult, PostProcessor, ResultMaterializer};
pub use orchestrator::{CancelHandle, TaskOrchestrator, TaskResult};
pub use progress::{JournalSink, ProgressModel, ProgressSink};
pub use quota::{QuotaDecision, QuotaGate};
