//! Event handler contract.

use crate::event::{Event, EventKind};

/// A callable registered for one or more event kinds.
///
/// `handle` returns whether the event was processed successfully; a
/// `false` is counted as a handler error but never stops dispatch to the
/// remaining handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event) -> bool;

    fn name(&self) -> &str;

    /// Whether this handler wants events of `kind`.
    fn handles(&self, kind: EventKind) -> bool;
}

/// An [`EventHandler`] wrapping a closure.
pub struct ClosureHandler {
    name: String,
    kinds: Vec<EventKind>,
    f: Box<dyn Fn(&Event) -> bool + Send + Sync>,
}

impl ClosureHandler {
    pub fn new(
        name: impl Into<String>,
        kinds: impl Into<Vec<EventKind>>,
        f: impl Fn(&Event) -> bool + Send + Sync + 'static,
    ) -> Self {
        ClosureHandler {
            name: name.into(),
            kinds: kinds.into(),
            f: Box::new(f),
        }
    }
}

impl EventHandler for ClosureHandler {
    fn handle(&self, event: &Event) -> bool {
        (self.f)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn handles(&self, kind: EventKind) -> bool {
        self.kinds.contains(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_handler_reports_its_kinds() {
        let handler = ClosureHandler::new(
            "logger",
            [EventKind::SystemStart, EventKind::SystemStop],
            |_| true,
        );
        assert!(handler.handles(EventKind::SystemStart));
        assert!(!handler.handles(EventKind::Custom));
        assert_eq!(handler.name(), "logger");
        assert!(handler.handle(&Event::new(EventKind::SystemStart)));
    }
}
