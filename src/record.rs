/// Structured log records produced by the line parser.
use chrono::NaiveDateTime;
use serde::Serialize;
use std::sync::Arc;

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Level {
    /// Map a level word from a log line onto the five known levels.
    ///
    /// loguru's TRACE and SUCCESS fold into DEBUG and INFO; WARN and FATAL
    /// are the common aliases of WARNING and CRITICAL.
    pub fn from_word(word: &str) -> Option<Level> {
        match word.to_ascii_uppercase().as_str() {
            "TRACE" | "DEBUG" => Some(Level::Debug),
            "INFO" | "SUCCESS" => Some(Level::Info),
            "WARNING" | "WARN" => Some(Level::Warning),
            "ERROR" => Some(Level::Error),
            "CRITICAL" | "FATAL" => Some(Level::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse tag derived from the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Heartbeat,
    UserMessage,
    BotReply,
    ManualMode,
    Error,
    System,
}

impl Category {
    pub fn from_name(name: &str) -> Option<Category> {
        match name {
            "heartbeat" => Some(Category::Heartbeat),
            "user_message" => Some(Category::UserMessage),
            "bot_reply" => Some(Category::BotReply),
            "manual_mode" => Some(Category::ManualMode),
            "error" => Some(Category::Error),
            "system" => Some(Category::System),
            _ => None,
        }
    }
}

/// One parsed line of worker output. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub timestamp: NaiveDateTime,
    pub level: Level,
    pub module: Option<String>,
    pub function: Option<String>,
    pub line: Option<u32>,
    pub message: String,
    pub category: Category,
    pub raw_line: String,
}

/// A record stamped with its position in the feed.
///
/// Sequence numbers increase by one per ingested record and let a viewer
/// splice the history snapshot and the live stream without duplicates.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub seq: u64,
    #[serde(flatten)]
    pub record: Arc<LogRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_aliases() {
        assert_eq!(Level::from_word("WARN"), Some(Level::Warning));
        assert_eq!(Level::from_word("success"), Some(Level::Info));
        assert_eq!(Level::from_word("TRACE"), Some(Level::Debug));
        assert_eq!(Level::from_word("FATAL"), Some(Level::Critical));
        assert_eq!(Level::from_word("NOTICE"), None);
    }

    #[test]
    fn test_level_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Level::Warning).unwrap(), "\"WARNING\"");
        assert_eq!(Level::Critical.to_string(), "CRITICAL");
    }

    #[test]
    fn test_category_names_round_trip_through_serde() {
        for cat in [
            Category::Heartbeat,
            Category::UserMessage,
            Category::BotReply,
            Category::ManualMode,
            Category::Error,
            Category::System,
        ] {
            let json = serde_json::to_string(&cat).unwrap();
            let name = json.trim_matches('"');
            assert_eq!(Category::from_name(name), Some(cat));
        }
    }

    #[test]
    fn test_envelope_flattens_record_fields() {
        let record = LogRecord {
            timestamp: chrono::NaiveDate::from_ymd_opt(2024, 1, 20)
                .unwrap()
                .and_hms_milli_opt(10, 30, 0, 123)
                .unwrap(),
            level: Level::Info,
            module: Some("main".to_string()),
            function: Some("handle".to_string()),
            line: Some(42),
            message: "hello".to_string(),
            category: Category::System,
            raw_line: "raw".to_string(),
        };
        let env = Envelope {
            seq: 7,
            record: Arc::new(record),
        };

        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["seq"], 7);
        assert_eq!(v["timestamp"], "2024-01-20T10:30:00.123");
        assert_eq!(v["level"], "INFO");
        assert_eq!(v["module"], "main");
        assert_eq!(v["line"], 42);
        assert_eq!(v["category"], "system");
        assert_eq!(v["raw_line"], "raw");
    }
}
