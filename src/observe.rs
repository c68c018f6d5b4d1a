//! Structured pipeline events.
//!
//! Workers report through an [`ObsSink`] so tests can capture events and
//! hosts can route them; the default sink forwards to `tracing`.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObsLevel {
    Info,
    Warn,
    Error,
}

/// One pipeline event. `event` is a stable machine-readable name; the
/// remaining fields are correlation context.
#[derive(Debug, Clone)]
pub struct ObsEvent<'a> {
    pub level: ObsLevel,
    pub event: &'static str,
    pub message: &'a str,
    pub job_id: Option<&'a str>,
    pub user_id: Option<&'a str>,
    pub queue: Option<&'a str>,
    pub trace_id: Option<&'a str>,
    pub detail: Value,
}

impl<'a> ObsEvent<'a> {
    pub fn new(level: ObsLevel, event: &'static str, message: &'a str) -> Self {
        Self {
            level,
            event,
            message,
            job_id: None,
            user_id: None,
            queue: None,
            trace_id: None,
            detail: Value::Null,
        }
    }

    pub fn info(event: &'static str, message: &'a str) -> Self {
        Self::new(ObsLevel::Info, event, message)
    }

    pub fn warn(event: &'static str, message: &'a str) -> Self {
        Self::new(ObsLevel::Warn, event, message)
    }

    pub fn error(event: &'static str, message: &'a str) -> Self {
        Self::new(ObsLevel::Error, event, message)
    }

    pub fn job_id(mut self, job_id: &'a str) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn user_id(mut self, user_id: &'a str) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn queue(mut self, queue: &'a str) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn trace_id(mut self, trace_id: Option<&'a str>) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

pub trait ObsSink: Send + Sync {
    fn emit(&self, event: ObsEvent<'_>);
}

/// Forwards events to `tracing` with the event name and correlation ids as
/// structured fields.
#[derive(Default)]
pub struct TracingSink;

impl ObsSink for TracingSink {
    fn emit(&self, e: ObsEvent<'_>) {
        match e.level {
            ObsLevel::Info => tracing::info!(
                event = e.event,
                job_id = e.job_id,
                user_id = e.user_id,
                queue = e.queue,
                trace_id = e.trace_id,
                detail = %e.detail,
                "{}",
                e.message
            ),
            ObsLevel::Warn => tracing::warn!(
                event = e.event,
                job_id = e.job_id,
                user_id = e.user_id,
                queue = e.queue,
                trace_id = e.trace_id,
                detail = %e.detail,
                "{}",
                e.message
            ),
            ObsLevel::Error => tracing::error!(
                event = e.event,
                job_id = e.job_id,
                user_id = e.user_id,
                queue = e.queue,
                trace_id = e.trace_id,
                detail = %e.detail,
                "{}",
                e.message
            ),
        }
    }
}

/// Discards every event.
#[derive(Default)]
pub struct NoopSink;

impl ObsSink for NoopSink {
    fn emit(&self, _event: ObsEvent<'_>) {}
}
