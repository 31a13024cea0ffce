//! # Event Log
//!
//! This crate implements structured event records for the device layer.
//!
//! ## Philosophy
//!
//! Events are explicit and structured, not text-based or printf-style.
//! Collaborators append typed records through a shared sink and decide
//! separately how to surface them.

use dev_types::DevNum;
use std::sync::Mutex;

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventLevel {
    /// Debug information
    Debug,
    /// Informational events
    Info,
    /// Warnings
    Warn,
    /// Errors
    Error,
}

/// A structured device-layer event
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    /// Severity
    pub level: EventLevel,
    /// Driver the event concerns, if any
    pub source: Option<String>,
    /// Event message
    pub message: String,
    /// Structured fields
    pub fields: Vec<(String, String)>,
}

impl DeviceEvent {
    /// Creates a new event
    pub fn new(level: EventLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            source: None,
            message: message.into(),
            fields: Vec::new(),
        }
    }

    /// Sets the driver the event concerns
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Adds a structured field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    /// A driver claimed a device-number region
    pub fn attached(driver: impl Into<String>, base: DevNum, count: u64) -> Self {
        Self::new(EventLevel::Info, "driver attached")
            .with_source(driver)
            .with_field("base", base.to_string())
            .with_field("count", count.to_string())
    }

    /// A driver released its claims
    pub fn detached(driver: impl Into<String>) -> Self {
        Self::new(EventLevel::Info, "driver detached").with_source(driver)
    }

    /// A lookup fell through to the sentinel
    pub fn probe_missed(dev: DevNum) -> Self {
        Self::new(EventLevel::Debug, "no driver claims device number")
            .with_field("dev", dev.to_string())
    }
}

/// A shared append sink for device events
///
/// Interior-mutable so collaborators can record through `&self`.
#[derive(Debug, Default)]
pub struct EventLog {
    entries: Mutex<Vec<DeviceEvent>>,
}

impl EventLog {
    /// Creates an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event
    pub fn record(&self, event: DeviceEvent) {
        self.entries.lock().expect("event log lock").push(event);
    }

    /// Returns a snapshot of all recorded events, oldest first
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.entries.lock().expect("event log lock").clone()
    }

    /// Number of recorded events
    pub fn len(&self) -> usize {
        self.entries.lock().expect("event log lock").len()
    }

    /// Returns whether nothing has been recorded yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
