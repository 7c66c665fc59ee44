/// Bounded ring of the most recent records, used to seed new viewers.
use crate::record::{Category, Envelope, Level, LogRecord};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

pub struct HistoryRing {
    capacity: usize,
    entries: VecDeque<Envelope>,
    next_seq: u64,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            next_seq: 1,
        }
    }

    /// Append a record, evicting the oldest when full. Returns the record
    /// stamped with its sequence number.
    pub fn push(&mut self, record: LogRecord) -> Envelope {
        let envelope = Envelope {
            seq: self.next_seq,
            record: Arc::new(record),
        };
        self.next_seq += 1;
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(envelope.clone());
        envelope
    }

    /// Up to `limit` most recent records, oldest first.
    pub fn snapshot(&self, limit: usize) -> Vec<Envelope> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// Sequence number of the newest record, 0 when nothing was pushed yet.
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Records matching `filter`, newest `filter.limit` of them, oldest first.
    pub fn search(&self, filter: &SearchFilter) -> Vec<Envelope> {
        let keyword = filter.keyword.as_ref().map(|k| k.to_lowercase());
        let mut hits: Vec<Envelope> = self
            .entries
            .iter()
            .rev()
            .filter(|e| {
                let r = &e.record;
                keyword
                    .as_ref()
                    .map_or(true, |k| r.message.to_lowercase().contains(k))
                    && filter.level.map_or(true, |l| r.level == l)
                    && filter.category.map_or(true, |c| r.category == c)
                    && filter.since.map_or(true, |t| r.timestamp >= t)
                    && filter.until.map_or(true, |t| r.timestamp <= t)
            })
            .take(filter.limit)
            .cloned()
            .collect();
        hits.reverse();
        hits
    }

    /// Per-level counts and the most recent errors.
    pub fn stats(&self) -> HistoryStats {
        let mut level_counts = BTreeMap::new();
        for e in &self.entries {
            *level_counts.entry(e.record.level).or_insert(0) += 1;
        }
        let mut recent_errors: Vec<ErrorSummary> = self
            .entries
            .iter()
            .rev()
            .filter(|e| e.record.level >= Level::Error)
            .take(RECENT_ERRORS)
            .map(|e| ErrorSummary {
                timestamp: e.record.timestamp,
                message: e.record.message.chars().take(ERROR_PREVIEW_CHARS).collect(),
            })
            .collect();
        recent_errors.reverse();

        HistoryStats {
            total_count: self.entries.len(),
            capacity: self.capacity,
            last_seq: self.last_seq(),
            level_counts,
            recent_errors,
        }
    }
}

const RECENT_ERRORS: usize = 10;
const ERROR_PREVIEW_CHARS: usize = 100;

/// Criteria for [`HistoryRing::search`]. Unset fields match everything.
#[derive(Debug, Clone)]
pub struct SearchFilter {
    /// Case-insensitive substring of the message.
    pub keyword: Option<String>,
    pub level: Option<Level>,
    pub category: Option<Category>,
    pub since: Option<NaiveDateTime>,
    pub until: Option<NaiveDateTime>,
    pub limit: usize,
}

impl Default for SearchFilter {
    fn default() -> Self {
        Self {
            keyword: None,
            level: None,
            category: None,
            since: None,
            until: None,
            limit: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryStats {
    pub total_count: usize,
    pub capacity: usize,
    pub last_seq: u64,
    pub level_counts: BTreeMap<Level, usize>,
    pub recent_errors: Vec<ErrorSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub timestamp: NaiveDateTime,
    pub message: String,
}
