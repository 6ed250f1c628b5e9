//! Device log stream: `pioreactor/<unit>/<experiment>/logs/<source>` carrying
//! `{level, message, task}` JSON. Only the most recent events are kept.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "DEBUG" => LogLevel::Debug,
            "NOTICE" => LogLevel::Notice,
            "WARNING" | "WARN" => LogLevel::Warning,
            "ERROR" => LogLevel::Error,
            "CRITICAL" => LogLevel::Critical,
            _ => LogLevel::Info,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LogPayload {
    level: String,
    message: String,
    #[serde(default)]
    task: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEvent {
    pub unit: String,
    pub source: String,
    pub level: LogLevel,
    pub message: String,
    pub task: String,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

impl LogEvent {
    pub fn decode(unit: &str, source: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        let parsed: LogPayload = serde_json::from_slice(payload)?;
        Ok(Self {
            unit: unit.to_string(),
            source: source.to_string(),
            level: LogLevel::parse(&parsed.level),
            message: parsed.message,
            task: parsed.task,
            received_at: OffsetDateTime::now_utc(),
        })
    }

    pub fn is_problem(&self) -> bool {
        self.level >= LogLevel::Warning
    }
}

/// Bounded, newest-first.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    events: VecDeque<LogEvent>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, event: LogEvent) {
        if self.capacity == 0 {
            return;
        }
        if self.events.len() == self.capacity {
            self.events.pop_back();
        }
        self.events.push_front(event);
    }

    pub fn recent(&self) -> impl Iterator<Item = &LogEvent> {
        self.events.iter()
    }

    pub fn to_vec(&self) -> Vec<LogEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
