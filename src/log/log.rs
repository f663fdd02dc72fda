// SPDX-License-Identifier: GPL-2.0-or-later

pub mod request_log;

use common::{time::UnixNano, ILogger, LogEntry, LogLevel, LogSource, LogMessage};
use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;

/// Logger used everywhere across the application.
pub struct Logger {
    /// Internal logging feed.
    feed: broadcast::Sender<LogEntryWithTime>,

    /// Entries below this level are not printed to stdout. They are still
    /// sent to subscribers.
    min_level: LogLevel,
}

impl Logger {
    #[must_use]
    pub fn new(min_level: LogLevel) -> Self {
        let (feed, _) = broadcast::channel(64);
        Self { feed, min_level }
    }

    /// Subscribes to the log feed and returns a channel that receives all log entries.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntryWithTime> {
        self.feed.subscribe()
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(LogLevel::Info)
    }
}

impl ILogger for Logger {
    /// Sends log entry to all subscribers. The timestamp is applied now.
    fn log(&self, log: LogEntry) {
        let log = LogEntryWithTime {
            level: log.level,
            source: log.source,
            message: log.message,
            time: UnixNano::now(),
        };

        if log.level >= self.min_level {
            println!("{log}");
        }

        // Only returns an error if there are no subscribers.
        self.feed.send(log).ok();
    }
}

/// Log entry with time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogEntryWithTime {
    /// Severity.
    pub level: LogLevel,

    /// Source.
    pub source: LogSource,

    /// Message.
    pub message: LogMessage,

    // Timestamp.
    pub time: UnixNano,
}

impl fmt::Display for LogEntryWithTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            LogLevel::Trace => write!(f, "[TRACE] ")?,
            LogLevel::Debug => write!(f, "[DEBUG] ")?,
            LogLevel::Info => write!(f, "[INFO] ")?,
            LogLevel::Notice => write!(f, "[NOTICE] ")?,
            LogLevel::Warning => write!(f, "[WARNING] ")?,
            LogLevel::Error => write!(f, "[ERROR] ")?,
            LogLevel::Critical => write!(f, "[CRITICAL] ")?,
        };

        let mut src_title = self.source.to_string();
        make_ascii_titlecase(&mut src_title);

        write!(f, "{}: {}", src_title, self.message)?;

        Ok(())
    }
}

/// Make the first character in a string uppercase.
fn make_ascii_titlecase(s: &mut str) {
    if let Some(r) = s.get_mut(0..1) {
        r.make_ascii_uppercase();
    }
}

#[allow(clippy::needless_pass_by_value, clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn logger_messages() {
        let logger = Logger::new(LogLevel::Critical);
        let mut feed = logger.subscribe();

        logger.log(LogEntry::new(LogLevel::Info, "s1", "1".to_owned()));
        logger.log(LogEntry::new(LogLevel::Warning, "s2", "2".to_owned()));

        let mut actual = vec![feed.recv().await.unwrap(), feed.recv().await.unwrap()];
        actual.iter_mut().for_each(|v| v.time = UnixNano::new(0));

        let expected = vec![
            LogEntryWithTime {
                level: LogLevel::Info,
                source: "s1".try_into().unwrap(),
                message: "1".to_owned().try_into().unwrap(),
                time: UnixNano::new(0),
            },
            LogEntryWithTime {
                level: LogLevel::Warning,
                source: "s2".try_into().unwrap(),
                message: "2".to_owned().try_into().unwrap(),
                time: UnixNano::new(0),
            },
        ];

        assert_eq!(expected, actual);
    }

    #[test]
    fn entry_format() {
        let entry = LogEntryWithTime {
            level: LogLevel::Error,
            source: "stream".try_into().unwrap(),
            message: "it broke".to_owned().try_into().unwrap(),
            time: UnixNano::new(0),
        };
        assert_eq!("[ERROR] Stream: it broke", entry.to_string());
    }
}
