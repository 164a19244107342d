use iconsmith_contracts::events::EventJournal;
use iconsmith_contracts::task::{ProgressUpdate, TaskPhase};
use tracing::warn;

use crate::config::ProgressConfig;

/// Receives every progress update a running task publishes.
pub trait ProgressSink: Send + Sync {
    fn report(&self, update: &ProgressUpdate);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressUpdate) + Send + Sync,
{
    fn report(&self, update: &ProgressUpdate) {
        self(update)
    }
}

/// Writes progress into an [`EventJournal`]; write failures are logged, never propagated.
#[derive(Debug, Clone)]
pub struct JournalSink {
    journal: EventJournal,
    batch: bool,
}

impl JournalSink {
    pub fn new(journal: EventJournal) -> Self {
        Self {
            journal,
            batch: false,
        }
    }

    /// Sink for updates coming out of a `BatchCoordinator`.
    pub fn batch(journal: EventJournal) -> Self {
        Self {
            journal,
            batch: true,
        }
    }
}

impl ProgressSink for JournalSink {
    fn report(&self, update: &ProgressUpdate) {
        let written = if self.batch {
            self.journal.emit_batch_progress(update)
        } else {
            self.journal.emit_progress(update)
        };
        if let Err(err) = written {
            warn!(path = %self.journal.path().display(), error = %err, "failed to journal progress");
        }
    }
}

/// Turns sparse backend progress into a bar that always creeps forward.
///
/// Backend fractions are mapped into `[floor, floor + window]`. Ticks without a usable
/// backend value push the floor up by `floor_step` until `floor_cap`. The displayed value
/// never decreases and stays below 1.0 until the task completes.
#[derive(Debug, Clone)]
pub struct ProgressModel {
    config: ProgressConfig,
    floor: f64,
    displayed: f64,
}

impl ProgressModel {
    pub fn new(config: ProgressConfig) -> Self {
        let floor = config.submitted;
        Self {
            config,
            floor,
            displayed: 0.0,
        }
    }

    pub fn value(&self) -> f64 {
        self.displayed
    }

    pub fn on_phase(&mut self, phase: TaskPhase) -> f64 {
        let baseline = match phase {
            TaskPhase::Created => 0.0,
            TaskPhase::QuotaChecked => self.config.quota_checked,
            TaskPhase::Submitted | TaskPhase::Polling => self.config.submitted,
            TaskPhase::Completed => 1.0,
            TaskPhase::Failed | TaskPhase::Cancelled => self.displayed,
        };
        self.raise(baseline)
    }

    pub fn on_tick(&mut self, backend: Option<f64>) -> f64 {
        let candidate = match backend.filter(|value| value.is_finite()) {
            Some(fraction) => self.floor + self.config.window * fraction.clamp(0.0, 1.0),
            None => {
                self.floor = (self.floor + self.config.floor_step).min(self.config.floor_cap);
                self.floor
            }
        };
        self.raise(candidate.min(self.config.ceiling))
    }

    pub fn complete(&mut self) -> f64 {
        self.raise(1.0)
    }

    fn raise(&mut self, candidate: f64) -> f64 {
        if candidate > self.displayed {
            self.displayed = candidate;
        }
        self.displayed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use iconsmith_contracts::events::EventJournal;
    use iconsmith_contracts::task::{ProgressUpdate, TaskPhase};

    use super::{JournalSink, ProgressModel, ProgressSink};
    use crate::config::ProgressConfig;

    fn approx(left: f64, right: f64) -> bool {
        (left - right).abs() < 1e-9
    }

    #[test]
    fn phases_set_baselines() {
        let mut model = ProgressModel::new(ProgressConfig::default());
        assert!(approx(model.on_phase(TaskPhase::QuotaChecked), 0.05));
        assert!(approx(model.on_phase(TaskPhase::Submitted), 0.10));
        assert!(approx(model.on_phase(TaskPhase::Failed), 0.10));
    }

    #[test]
    fn backend_fraction_maps_into_window_above_floor() {
        let mut model = ProgressModel::new(ProgressConfig::default());
        model.on_phase(TaskPhase::Submitted);
        assert!(approx(model.on_tick(Some(0.5)), 0.10 + 0.65 * 0.5));
    }

    #[test]
    fn silent_ticks_creep_up_to_the_cap() {
        let mut model = ProgressModel::new(ProgressConfig::default());
        assert!(approx(model.on_tick(None), 0.13));
        assert!(approx(model.on_tick(None), 0.16));
        for _ in 0..100 {
            model.on_tick(None);
        }
        assert!(approx(model.value(), 0.85));
    }

    #[test]
    fn displayed_value_never_decreases_and_stays_below_one() {
        let mut model = ProgressModel::new(ProgressConfig::default());
        let mut last = 0.0;
        for backend in [Some(0.9), Some(0.1), None, Some(f64::NAN), Some(1.0), None, Some(0.0)] {
            let value = model.on_tick(backend);
            assert!(value >= last);
            assert!(value <= 0.99);
            last = value;
        }
        for _ in 0..50 {
            model.on_tick(Some(1.0));
        }
        assert!(model.value() <= 0.99);
        assert!(approx(model.complete(), 1.0));
    }

    #[test]
    fn closures_are_sinks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        let sink = move |update: &ProgressUpdate| {
            if let Ok(mut seen) = captured.lock() {
                seen.push(update.progress_fraction);
            }
        };
        sink.report(&ProgressUpdate {
            task_id: "t".to_string(),
            slot: None,
            phase: TaskPhase::Polling,
            progress_fraction: 0.3,
            phase_label: TaskPhase::Polling.label().to_string(),
            polls: 1,
        });
        assert_eq!(seen.lock().map(|seen| seen.clone()).unwrap_or_default(), vec![0.3]);
    }

    #[test]
    fn journal_sink_appends_events() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let sink = JournalSink::new(EventJournal::new(&path, "s-1"));
        sink.report(&ProgressUpdate {
            task_id: "t".to_string(),
            slot: None,
            phase: TaskPhase::Completed,
            progress_fraction: 1.0,
            phase_label: TaskPhase::Completed.label().to_string(),
            polls: 3,
        });
        JournalSink::batch(EventJournal::new(&path, "s-1")).report(&ProgressUpdate {
            task_id: "batch".to_string(),
            slot: Some(1),
            phase: TaskPhase::Polling,
            progress_fraction: 0.6,
            phase_label: TaskPhase::Polling.label().to_string(),
            polls: 1,
        });
        let content = std::fs::read_to_string(&path)?;
        let types: Vec<String> = content
            .lines()
            .map(serde_json::from_str::<serde_json::Value>)
            .collect::<Result<Vec<_>, _>>()?
            .iter()
            .map(|event| event["type"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(types, vec!["task_finished", "batch_progress"]);
        Ok(())
    }
}
