/// Line parser: turns one raw worker log line into a `LogRecord`.
///
/// Formats are tried in a fixed order and the first match wins:
///
/// 1. `Loguru`: `2024-01-20 10:30:00.123 | INFO     | main:handle:42 - message`
///    (the `:function` part is optional)
/// 2. `Standard`: `2024-01-20 10:30:00,123 INFO message`, also `ts - LEVEL - message`
/// 3. `Bare`: `ERROR: message`
/// 4. `Fallback`: any other line containing a level keyword becomes an INFO
///    record from module `unknown`
///
/// Blank lines and `#` comment lines are skipped. ANSI colour codes are
/// stripped before matching, so coloured console output parses the same way.
use crate::record::{Category, Level, LogRecord};
use chrono::{Local, NaiveDateTime};
use regex::{Captures, Regex};
use std::sync::LazyLock;

/// Which format produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFormat {
    Loguru,
    Standard,
    Bare,
    Fallback,
}

const TIMESTAMP: &str = r"\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?";
const LEVEL_WORDS: &str = "TRACE|DEBUG|INFO|SUCCESS|WARNING|WARN|ERROR|CRITICAL|FATAL";

/// Ordered format table. Order is precedence.
static FORMATS: LazyLock<Vec<(LineFormat, Regex)>> = LazyLock::new(|| {
    vec![
        (
            LineFormat::Loguru,
            Regex::new(&format!(
                r"^(?P<ts>{TIMESTAMP})\s*\|\s*(?P<level>\w+)\s*\|\s*(?P<module>[^:\s|]+)(?::(?P<function>[^:\s]+))?:(?P<line>\d+)\s*-\s*(?P<message>.*)$"
            ))
            .unwrap(),
        ),
        (
            LineFormat::Standard,
            Regex::new(&format!(
                r"^(?P<ts>{TIMESTAMP})\s+(?:-\s+)?(?P<level>{LEVEL_WORDS})\b\s*(?:[-:]\s*)?(?P<message>.*)$"
            ))
            .unwrap(),
        ),
        (
            LineFormat::Bare,
            Regex::new(&format!(r"^(?P<level>{LEVEL_WORDS}):\s*(?P<message>.*)$")).unwrap(),
        ),
    ]
});

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap());

/// Keywords that make an unmatched line worth keeping.
const FALLBACK_KEYWORDS: &[&str] = &["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"];

/// How a category rule inspects the message.
#[derive(Debug, Clone, Copy)]
enum Matcher {
    Contains(&'static str),
    /// Needle must be lowercase.
    ContainsNoCase(&'static str),
    StartsWith(&'static str),
}

impl Matcher {
    fn matches(&self, message: &str, lowered: &str) -> bool {
        match self {
            Matcher::Contains(needle) => message.contains(needle),
            Matcher::ContainsNoCase(needle) => lowered.contains(needle),
            Matcher::StartsWith(prefix) => message.starts_with(prefix),
        }
    }
}

/// Category rules in priority order; the first rule with a hit wins.
const CATEGORY_RULES: &[(Category, &[Matcher])] = &[
    (
        Category::Heartbeat,
        &[
            Matcher::Contains("心跳"),
            Matcher::Contains("连接"),
            Matcher::Contains("Token"),
            Matcher::Contains("注册完成"),
            Matcher::ContainsNoCase("websocket"),
            Matcher::ContainsNoCase("heartbeat"),
            Matcher::ContainsNoCase("connection"),
        ],
    ),
    (
        Category::UserMessage,
        &[
            Matcher::StartsWith("用户:"),
            Matcher::StartsWith("User:"),
            Matcher::Contains("用户名"),
        ],
    ),
    (
        Category::BotReply,
        &[
            Matcher::StartsWith("机器人回复:"),
            Matcher::StartsWith("Bot reply:"),
            Matcher::Contains("AI回复"),
            Matcher::ContainsNoCase("ai reply"),
        ],
    ),
    (
        Category::ManualMode,
        &[
            Matcher::Contains("接管"),
            Matcher::Contains("人工"),
            Matcher::Contains("手动"),
            Matcher::Contains("🔴"),
            Matcher::Contains("🟢"),
            Matcher::ContainsNoCase("manual mode"),
            Matcher::ContainsNoCase("takeover"),
        ],
    ),
    (
        Category::Error,
        &[
            Matcher::Contains("错误"),
            Matcher::Contains("失败"),
            Matcher::Contains("异常"),
            Matcher::ContainsNoCase("error"),
            Matcher::ContainsNoCase("exception"),
            Matcher::ContainsNoCase("failed"),
        ],
    ),
];

/// Parse one line. Returns `None` for blank lines, comments, and lines with
/// no recognisable structure or level keyword.
pub fn parse_line(line: &str) -> Option<LogRecord> {
    parse_line_with_format(line).map(|(_, record)| record)
}

/// Like [`parse_line`], also reporting which format matched.
pub fn parse_line_with_format(line: &str) -> Option<(LineFormat, LogRecord)> {
    let raw = line.trim_end_matches(['\r', '\n']);
    let cleaned = ANSI_ESCAPE.replace_all(raw, "");
    let trimmed = cleaned.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }

    for (format, pattern) in FORMATS.iter() {
        if let Some(caps) = pattern.captures(trimmed) {
            return Some((*format, from_captures(&caps, raw)));
        }
    }

    let upper = trimmed.to_uppercase();
    if FALLBACK_KEYWORDS.iter().any(|kw| upper.contains(kw)) {
        // The level is deliberately not inferred from the keyword here.
        tracing::trace!(line = %trimmed, "no format matched, keeping best-effort record");
        return Some((
            LineFormat::Fallback,
            LogRecord {
                timestamp: now(),
                level: Level::Info,
                module: Some("unknown".to_string()),
                function: None,
                line: None,
                message: trimmed.to_string(),
                category: categorize(trimmed),
                raw_line: raw.to_string(),
            },
        ));
    }

    None
}

fn from_captures(caps: &Captures<'_>, raw: &str) -> LogRecord {
    let text = |name: &str| caps.name(name).map(|m| m.as_str());
    let message = text("message").unwrap_or("").trim().to_string();

    LogRecord {
        timestamp: text("ts").map(parse_timestamp).unwrap_or_else(now),
        level: text("level")
            .and_then(Level::from_word)
            .unwrap_or(Level::Info),
        module: text("module").map(str::to_string),
        function: text("function").map(str::to_string),
        line: text("line").and_then(|l| l.parse().ok()),
        category: categorize(&message),
        message,
        raw_line: raw.to_string(),
    }
}

/// Parse a log timestamp, falling back to the current local time.
pub fn parse_timestamp(text: &str) -> NaiveDateTime {
    try_parse_timestamp(text).unwrap_or_else(|| {
        tracing::debug!(timestamp = %text, "unparsable timestamp, using current time");
        now()
    })
}

/// Strict variant of [`parse_timestamp`]: `None` instead of "now".
pub fn try_parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let normalized = text.trim().replace(',', ".").replacen('T', " ", 1);
    const FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"];

    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&normalized, fmt).ok())
}

/// Derive a category from message text.
pub fn categorize(message: &str) -> Category {
    let lowered = message.to_lowercase();
    CATEGORY_RULES
        .iter()
        .find(|(_, matchers)| matchers.iter().any(|m| m.matches(message, &lowered)))
        .map(|(category, _)| *category)
        .unwrap_or(Category::System)
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}
