//! Typed events carried by the workflow engine.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

/// What an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SystemStart,
    SystemStop,
    ServiceRegister,
    ServiceUnregister,
    MessageReceived,
    ConnectionEstablished,
    ConnectionLost,
    ErrorOccurred,
    Custom,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::SystemStart,
        EventKind::SystemStop,
        EventKind::ServiceRegister,
        EventKind::ServiceUnregister,
        EventKind::MessageReceived,
        EventKind::ConnectionEstablished,
        EventKind::ConnectionLost,
        EventKind::ErrorOccurred,
        EventKind::Custom,
    ];
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::SystemStart => "system-start",
            EventKind::SystemStop => "system-stop",
            EventKind::ServiceRegister => "service-register",
            EventKind::ServiceUnregister => "service-unregister",
            EventKind::MessageReceived => "message-received",
            EventKind::ConnectionEstablished => "connection-established",
            EventKind::ConnectionLost => "connection-lost",
            EventKind::ErrorOccurred => "error-occurred",
            EventKind::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// A value describing one occurrence: kind, endpoints, free-form string
/// parameters, a priority (larger is more urgent) and a monotonic
/// timestamp taken at construction.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub source: String,
    pub target: String,
    pub params: HashMap<String, String>,
    pub priority: u8,
    pub timestamp: Instant,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Event {
            kind,
            source: String::new(),
            target: String::new(),
            params: HashMap::new(),
            priority: 0,
            timestamp: Instant::now(),
        }
    }

    pub fn set_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn set_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn set_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn set_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if !self.source.is_empty() {
            write!(f, " from {}", self.source)?;
        }
        if !self.target.is_empty() {
            write!(f, " to {}", self.target)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_fields() {
        let event = Event::new(EventKind::Custom)
            .set_source("unit-a")
            .set_target("unit-b")
            .set_param("session", "42")
            .set_priority(7);

        assert_eq!(event.kind, EventKind::Custom);
        assert_eq!(event.source, "unit-a");
        assert_eq!(event.target, "unit-b");
        assert_eq!(event.param("session"), Some("42"));
        assert_eq!(event.param("missing"), None);
        assert_eq!(event.priority, 7);
    }

    #[test]
    fn display_is_compact() {
        let event = Event::new(EventKind::MessageReceived).set_source("peer");
        assert_eq!(event.to_string(), "message-received from peer");
    }
}
