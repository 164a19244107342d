use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::ProgressUpdate;

/// What a journal line records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalEventKind {
    BatchStarted,
    TaskProgress,
    TaskFinished,
    BatchProgress,
    BatchFinished,
}

impl JournalEventKind {
    /// `task_finished` for terminal updates, `task_progress` otherwise.
    pub fn for_task(update: &ProgressUpdate) -> Self {
        if update.phase.is_terminal() {
            Self::TaskFinished
        } else {
            Self::TaskProgress
        }
    }
}

/// One journal line: a typed envelope with the body's fields inlined next to it.
#[derive(Debug, Serialize)]
pub struct JournalEvent<'a, T: Serialize> {
    #[serde(rename = "type")]
    pub kind: JournalEventKind,
    pub session_id: &'a str,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub body: &'a T,
}

/// Append-only JSONL journal of generation events, shared across tasks of one session.
#[derive(Debug, Clone)]
pub struct EventJournal {
    shared: Arc<JournalFile>,
}

#[derive(Debug)]
struct JournalFile {
    path: PathBuf,
    session_id: String,
    handle: Mutex<Option<File>>,
}

impl EventJournal {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(JournalFile {
                path: path.into(),
                session_id: session_id.into(),
                handle: Mutex::new(None),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// Appends one `kind` event whose body is `body`'s serialized fields.
    pub fn record<T: Serialize>(&self, kind: JournalEventKind, body: &T) -> anyhow::Result<()> {
        let event = JournalEvent {
            kind,
            session_id: &self.shared.session_id,
            ts: Utc::now(),
            body,
        };
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        self.shared.append(&line)
    }

    pub fn emit_progress(&self, update: &ProgressUpdate) -> anyhow::Result<()> {
        self.record(JournalEventKind::for_task(update), update)
    }

    /// Aggregate progress of a batch; `update.slot` names the slot that moved.
    pub fn emit_batch_progress(&self, update: &ProgressUpdate) -> anyhow::Result<()> {
        self.record(JournalEventKind::BatchProgress, update)
    }
}

impl JournalFile {
    fn append(&self, line: &[u8]) -> anyhow::Result<()> {
        let mut handle = self
            .handle
            .lock()
            .map_err(|_| anyhow::anyhow!("journal {} lock poisoned", self.path.display()))?;
        if handle.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            *handle = Some(OpenOptions::new().create(true).append(true).open(&self.path)?);
        }
        if let Some(file) = handle.as_mut() {
            file.write_all(line)?;
        }
        Ok(())
    }
}
