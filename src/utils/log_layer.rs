//! Bridge from `tracing` to the event bus.
//!
//! The engine logs through `tracing` like everything else; this layer
//! mirrors WARN and ERROR records onto the bus as `LogLine` events so a
//! UI subscriber sees operational problems without scraping stderr.

use std::fmt::Write as _;

use tracing::field::{Field, Visit};
use tracing::{Event as TracingEvent, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::core::events::{Event, EventBus};

pub struct BusLayer {
    bus: EventBus,
    max_level: Level,
}

impl BusLayer {
    /// Forward records at `max_level` or more severe to the bus.
    pub fn new(bus: EventBus, max_level: Level) -> Self {
        Self { bus, max_level }
    }
}

/// Captures only the rendered log message. A `LogLine` is a flat human
/// string; structured fields stay in the tracing output proper.
struct LineVisitor {
    line: String,
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.line, "{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for BusLayer {
    fn on_event(&self, event: &TracingEvent<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > self.max_level {
            return;
        }
        let mut visitor = LineVisitor {
            line: String::new(),
        };
        event.record(&mut visitor);
        if visitor.line.is_empty() {
            visitor.line = event.metadata().target().to_string();
        }
        self.bus.publish(Event::LogLine {
            level,
            text: visitor.line,
        });
    }
}
