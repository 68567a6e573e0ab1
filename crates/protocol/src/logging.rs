//! Syslog-style severity levels used by `notifications/message`.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// The eight MCP logging levels, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl LoggingLevel {
    pub const ALL: [Self; 8] = [
        Self::Debug,
        Self::Info,
        Self::Notice,
        Self::Warning,
        Self::Error,
        Self::Critical,
        Self::Alert,
        Self::Emergency,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Notice => "notice",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
            Self::Alert => "alert",
            Self::Emergency => "emergency",
        }
    }

    /// Numeric rank, 0 for `debug` through 7 for `emergency`.
    pub fn rank(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for LoggingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown logging level '{0}'")]
pub struct UnknownLevel(pub String);

impl FromStr for LoggingLevel {
    type Err = UnknownLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|level| level.as_str() == lower)
            .ok_or_else(|| UnknownLevel(s.to_string()))
    }
}

/// Whether a message at `level` passes the `minimum` filter.
///
/// Fails open: when either side is not a recognised level the message is kept.
pub fn should_log(level: &str, minimum: &str) -> bool {
    match (level.parse::<LoggingLevel>(), minimum.parse::<LoggingLevel>()) {
        (Ok(level), Ok(minimum)) => level >= minimum,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_matches_rank() {
        for pair in LoggingLevel::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[0].rank() + 1, pair[1].rank());
        }
        assert_eq!(LoggingLevel::Emergency.rank(), 7);
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("WARNING".parse::<LoggingLevel>(), Ok(LoggingLevel::Warning));
        assert!("warn".parse::<LoggingLevel>().is_err());
    }

    #[test]
    fn suppressed_exactly_below_minimum() {
        for level in LoggingLevel::ALL {
            for minimum in LoggingLevel::ALL {
                assert_eq!(
                    should_log(level.as_str(), minimum.as_str()),
                    level.rank() >= minimum.rank(),
                    "{level} vs {minimum}"
                );
            }
        }
    }

    #[test]
    fn unknown_levels_fail_open() {
        assert!(should_log("verbose", "error"));
        assert!(should_log("debug", "loud"));
        assert!(should_log("", ""));
    }

    #[test]
    fn serde_uses_lowercase() {
        let json = serde_json::to_string(&LoggingLevel::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
    }
}
