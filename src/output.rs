//! Output sinks for the event bus.
//!
//! Two interchangeable consumers exist: the [`PrefixSink`] here, which writes
//! `[task] line` to standard output, and the dashboard. Exactly one of them
//! consumes the bus per invocation. This module also provides the bounded
//! [`EventRing`] backing the dashboard's log view.

use std::collections::{HashMap, VecDeque};
use std::io::{IsTerminal, Write};

use tokio::sync::mpsc;

use crate::events::{Event, LogEvent};

/// Colour cycle for task labels, assigned in first-seen order.
const PALETTE: [&str; 6] = ["36", "32", "33", "35", "34", "31"];

/// Line-prefixing consumer of the event bus.
///
/// Each line becomes exactly one write of `[task] line\n` on the locked
/// stdout handle, so concurrent producers can never byte-interleave. Stderr
/// of children is multiplexed into the same stream; the event's stream field
/// is only meaningful to the dashboard.
pub struct PrefixSink {
    colors_enabled: bool,
    assigned: HashMap<String, &'static str>,
    next_color: usize,
}

impl PrefixSink {
    /// Creates a sink, enabling colour only for a terminal without the
    /// conventional `NO_COLOR` override.
    pub fn new() -> Self {
        let colors_enabled =
            std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
        Self::with_colors(colors_enabled)
    }

    pub fn with_colors(colors_enabled: bool) -> Self {
        Self {
            colors_enabled,
            assigned: HashMap::new(),
            next_color: 0,
        }
    }

    /// Consumes the bus until every producer has dropped its handle.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Event>) {
        while let Some(event) = rx.recv().await {
            let Event::Log(ev) = event else {
                continue;
            };
            let line = self.format(&ev);
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(line.as_bytes());
        }
        let _ = std::io::stdout().flush();
    }

    fn format(&mut self, ev: &LogEvent) -> String {
        if !self.colors_enabled {
            return format!("[{}] {}\n", ev.task, ev.line);
        }
        let color = self.color_for(&ev.task);
        format!("\u{1b}[{}m[{}]\u{1b}[0m {}\n", color, ev.task, ev.line)
    }

    fn color_for(&mut self, task: &str) -> &'static str {
        if let Some(color) = self.assigned.get(task) {
            return color;
        }
        let color = PALETTE[self.next_color % PALETTE.len()];
        self.next_color += 1;
        self.assigned.insert(task.to_string(), color);
        color
    }
}

/// A fixed-capacity ring of recent log events.
#[derive(Debug, Clone)]
pub struct EventRing {
    max_events: usize,
    events: VecDeque<LogEvent>,
}

impl EventRing {
    /// Creates a ring keeping at most `max_events` entries.
    pub fn new(max_events: usize) -> Self {
        Self {
            max_events,
            events: VecDeque::with_capacity(max_events.min(1024)),
        }
    }

    /// Adds an event, dropping the oldest once full.
    ///
    /// Returns `true` if an old event was dropped to make room.
    pub fn push(&mut self, event: LogEvent) -> bool {
        let mut dropped = false;
        self.events.push_back(event);
        while self.events.len() > self.max_events {
            self.events.pop_front();
            dropped = true;
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Iterates the retained events, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LogEvent> {
        self.events.iter()
    }
}
