//! Per-second rate counters and the periodic node report.
//!
//! Steady-state anomalies are never propagated as errors; they are counted
//! here and surface once per simulated second through [`RateReport`].

use tracing::{error, info, warn};

/// Severity of a rate report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagnosticLevel {
    Ok = 0,
    Warn = 1,
    Error = 2,
}

/// Counters reset at every report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateCounters {
    /// Filter updates completed
    pub updates: u64,
    /// Events moved from the queue into the window
    pub events_processed: u64,
    /// Events offered to the queue
    pub events_received: u64,
    /// Events refused by a full queue
    pub dropped: u64,
    /// Events forwarded by a filter
    pub forwarded: u64,
    /// Events masked out by a filter
    pub filtered: u64,
    /// Packets ignored as protocol errors
    pub protocol_errors: u64,
    /// Sends abandoned after the retry budget
    pub send_failures: u64,
    /// Deferred tasks refused by a full task queue
    pub schedule_failures: u64,
}

impl RateCounters {
    /// Return the current counts and start a new period.
    pub fn take(&mut self) -> RateCounters {
        std::mem::take(self)
    }
}

/// One report: a level, a message and key/value details.
#[derive(Debug, Clone)]
pub struct RateReport {
    node: usize,
    role: &'static str,
    level: DiagnosticLevel,
    message: String,
    key_values: Vec<(&'static str, String)>,
}

impl RateReport {
    pub fn new(node: usize, role: &'static str) -> Self {
        Self {
            node,
            role,
            level: DiagnosticLevel::Ok,
            message: String::new(),
            key_values: Vec::new(),
        }
    }

    pub fn add_key_value(&mut self, key: &'static str, value: impl ToString) {
        self.key_values.push((key, value.to_string()));
    }

    /// Raise the level. A less severe update is ignored.
    pub fn update_level_and_message(&mut self, level: DiagnosticLevel, message: &str) {
        if level > self.level {
            self.level = level;
            self.message = message.to_string();
        }
    }

    pub fn level(&self) -> DiagnosticLevel {
        self.level
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.key_values
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Build the report for one period of counters.
    pub fn from_counters(node: usize, role: &'static str, counters: &RateCounters) -> Self {
        let mut report = Self::new(node, role);
        report.add_key_value("update_hz", counters.updates);
        report.add_key_value("events_processed_hz", counters.events_processed);
        report.add_key_value("events_received_hz", counters.events_received);
        report.add_key_value("dropped_hz", counters.dropped);
        if counters.forwarded + counters.filtered > 0 {
            report.add_key_value("forwarded_hz", counters.forwarded);
            report.add_key_value("filtered_hz", counters.filtered);
        }

        if counters.dropped > 0 {
            report.update_level_and_message(DiagnosticLevel::Warn, "event queue overflow");
        }
        if counters.protocol_errors > 0 {
            report.add_key_value("protocol_errors", counters.protocol_errors);
            report.update_level_and_message(DiagnosticLevel::Warn, "protocol errors");
        }
        if counters.send_failures > 0 || counters.schedule_failures > 0 {
            report.add_key_value("send_failures", counters.send_failures);
            report.add_key_value("schedule_failures", counters.schedule_failures);
            report.update_level_and_message(DiagnosticLevel::Error, "packets or tasks lost");
        }
        report
    }

    fn summary(&self) -> String {
        self.key_values
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Log the report at its level.
    pub fn emit(&self) {
        let summary = self.summary();
        match self.level {
            DiagnosticLevel::Ok => {
                info!(node = self.node, role = self.role, "{summary}")
            }
            DiagnosticLevel::Warn => {
                warn!(node = self.node, role = self.role, "{}: {summary}", self.message)
            }
            DiagnosticLevel::Error => {
                error!(node = self.node, role = self.role, "{}: {summary}", self.message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_resets() {
        let mut counters = RateCounters {
            updates: 3,
            dropped: 1,
            ..RateCounters::default()
        };
        let period = counters.take();
        assert_eq!(period.updates, 3);
        assert_eq!(counters, RateCounters::default());
    }

    #[test]
    fn test_clean_period_is_ok() {
        let counters = RateCounters {
            updates: 250,
            events_processed: 4_000,
            events_received: 4_000,
            ..RateCounters::default()
        };
        let report = RateReport::from_counters(0, "particle", &counters);
        assert_eq!(report.level(), DiagnosticLevel::Ok);
        assert_eq!(report.get("update_hz"), Some("250"));
        assert_eq!(report.get("forwarded_hz"), None);
    }

    #[test]
    fn test_level_only_escalates() {
        let counters = RateCounters {
            dropped: 5,
            send_failures: 1,
            ..RateCounters::default()
        };
        let report = RateReport::from_counters(2, "particle", &counters);
        assert_eq!(report.level(), DiagnosticLevel::Error);
        assert_eq!(report.message(), "packets or tasks lost");

        let mut report = RateReport::new(0, "filter");
        report.update_level_and_message(DiagnosticLevel::Error, "first");
        report.update_level_and_message(DiagnosticLevel::Warn, "second");
        assert_eq!(report.message(), "first");
    }
}
