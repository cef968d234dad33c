use std::sync::{Arc, mpsc};

use crate::error::ErrorKind;
use crate::exec::{CommandRunner, SystemRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Resolve,
    Quiesce,
    Archive,
    Transfer,
    Restore,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::Resolve => "resolve",
            Step::Quiesce => "quiesce",
            Step::Archive => "archive",
            Step::Transfer => "transfer",
            Step::Restore => "restore",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    StepStarted {
        job_id: String,
        step: Step,
    },
    StepFinished {
        job_id: String,
        step: Step,
        ok: bool,
        error: Option<ErrorKind>,
        elapsed_ms: u128,
    },
    JobDone {
        job_id: String,
        ok: bool,
        error: Option<ErrorKind>,
        size_bytes: u64,
        elapsed_ms: u128,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, ev: JobEvent);
}

/// Default sink: every event becomes a structured log line.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, ev: JobEvent) {
        match ev {
            JobEvent::StepStarted { job_id, step } => {
                tracing::debug!(%job_id, step = step.as_str(), "step started");
            }
            JobEvent::StepFinished {
                job_id,
                step,
                ok: true,
                elapsed_ms,
                ..
            } => {
                tracing::debug!(%job_id, step = step.as_str(), elapsed_ms, "step finished");
            }
            JobEvent::StepFinished {
                job_id,
                step,
                error,
                elapsed_ms,
                ..
            } => {
                let kind = error.map(ErrorKind::as_str).unwrap_or("unknown");
                tracing::warn!(%job_id, step = step.as_str(), error_kind = kind, elapsed_ms, "step failed");
            }
            JobEvent::JobDone {
                job_id,
                ok,
                error,
                size_bytes,
                elapsed_ms,
            } => {
                let kind = error.map(ErrorKind::as_str).unwrap_or("none");
                tracing::debug!(%job_id, ok, error_kind = kind, size_bytes, elapsed_ms, "job done");
            }
        }
    }
}

/// Forwards events to an external consumer (metrics exporter, UI).
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<JobEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<JobEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, ev: JobEvent) {
        let _ = self.tx.send(ev);
    }
}

/// Everything a component needs from its surroundings for one job. Passed by
/// reference into each step; there is no process-wide state.
#[derive(Clone)]
pub struct JobCtx {
    pub job_id: String,
    pub runner: Arc<dyn CommandRunner>,
    pub sink: Arc<dyn EventSink>,
}

impl JobCtx {
    pub fn new(runner: Arc<dyn CommandRunner>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            job_id: new_job_id(),
            runner,
            sink,
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemRunner), Arc::new(TracingSink))
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = job_id.into();
        self
    }

    pub fn emit(&self, ev: JobEvent) {
        self.sink.emit(ev);
    }
}

/// First two groups of a v4 UUID: 12 hex characters, unique enough per host.
pub fn new_job_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_short_hex_and_distinct() {
        let a = new_job_id();
        let b = new_job_id();
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn channel_sink_forwards_events() {
        let (tx, rx) = mpsc::channel();
        let sink = ChannelSink::new(tx);
        sink.emit(JobEvent::StepStarted {
            job_id: "abc".into(),
            step: Step::Archive,
        });
        let got = rx.recv().expect("event");
        assert_eq!(
            got,
            JobEvent::StepStarted {
                job_id: "abc".into(),
                step: Step::Archive
            }
        );
    }
}
