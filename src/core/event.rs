//! Diagnostic event log entries

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use super::instance::InstanceId;

/// Default number of entries the shared event log retains
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 25;

/// One line of the shared event log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub timestamp: DateTime<Utc>,
    pub source: InstanceId,
    pub message: String,
}

impl EventLogEntry {
    /// Build an entry, flattening the message onto a single line
    pub fn new(timestamp: DateTime<Utc>, source: InstanceId, message: &str) -> Self {
        let message = message
            .split(['\r', '\n'])
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            timestamp: timestamp.trunc_subsecs(0),
            source,
            message,
        }
    }

    /// Serialized form: `[2024-01-01T00:00:00Z] WATCHDOG3: message`
    pub fn to_line(&self) -> String {
        format!(
            "[{}] WATCHDOG{}: {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.source,
            self.message
        )
    }

    /// Parse a serialized line, `None` if it is not one of ours
    pub fn parse_line(line: &str) -> Option<Self> {
        let rest = line.strip_prefix('[')?;
        let (timestamp, rest) = rest.split_once("] WATCHDOG")?;
        let (source, message) = rest.split_once(": ")?;

        let timestamp = DateTime::parse_from_rfc3339(timestamp)
            .ok()?
            .with_timezone(&Utc);
        let source = source.parse::<u32>().ok().map(InstanceId)?;

        Some(Self {
            timestamp,
            source,
            message: message.to_string(),
        })
    }
}

/// Append `entry` to `entries`, evicting the oldest until at most `capacity` remain
pub fn push_bounded(entries: &mut Vec<EventLogEntry>, entry: EventLogEntry, capacity: usize) {
    entries.push(entry);
    if entries.len() > capacity {
        let excess = entries.len() - capacity;
        entries.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_line_format() {
        let entry = EventLogEntry::new(ts(), InstanceId(3), "Restarted mpv");
        assert_eq!(
            entry.to_line(),
            "[2023-11-14T22:13:20Z] WATCHDOG3: Restarted mpv"
        );
    }

    #[test]
    fn test_parse_line_accepts_colons_in_message() {
        let line = "[2023-11-14T22:13:20Z] WATCHDOG1: launch failed: not found";
        let entry = EventLogEntry::parse_line(line).unwrap();
        assert_eq!(entry.source, InstanceId(1));
        assert_eq!(entry.message, "launch failed: not found");
        assert_eq!(entry.timestamp, ts());
    }

    #[test]
    fn test_parse_line_rejects_garbage() {
        assert!(EventLogEntry::parse_line("").is_none());
        assert!(EventLogEntry::parse_line("hello world").is_none());
        assert!(EventLogEntry::parse_line("[not a time] WATCHDOG1: x").is_none());
    }

    #[test]
    fn test_multiline_message_is_flattened() {
        let entry = EventLogEntry::new(ts(), InstanceId(2), "first\nsecond\r\nthird");
        assert_eq!(entry.message, "first second third");
        assert!(!entry.to_line().contains('\n'));
    }

    #[test]
    fn test_push_bounded_evicts_oldest() {
        let mut entries = Vec::new();
        for i in 0..30 {
            push_bounded(
                &mut entries,
                EventLogEntry::new(ts(), InstanceId(1), &format!("event {}", i)),
                25,
            );
        }
        assert_eq!(entries.len(), 25);
        assert_eq!(entries[0].message, "event 5");
        assert_eq!(entries[24].message, "event 29");
    }
}
