//! The log feed: history ring plus hub, and the tail loop that fills them.
//!
//! Data flows cursor -> splitter -> parser -> `LogFeed::ingest`, which
//! stamps each record with a sequence number, stores it in the ring and
//! publishes it to every subscriber.

use crate::history::{HistoryRing, HistoryStats, SearchFilter};
use crate::hub::{Hub, SubscriberInfo, Subscription};
use crate::parser::parse_line;
use crate::record::{Envelope, LogRecord};
use crate::tail::{LineSplitter, Poll, TailCursor, TailError};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct LogFeed {
    history: Mutex<HistoryRing>,
    hub: Arc<Hub>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedStats {
    #[serde(flatten)]
    pub history: HistoryStats,
    pub subscribers: Vec<SubscriberInfo>,
}

impl LogFeed {
    pub fn new(capacity: usize, subscriber_buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            history: Mutex::new(HistoryRing::new(capacity)),
            hub: Hub::new(subscriber_buffer),
        })
    }

    fn history(&self) -> MutexGuard<'_, HistoryRing> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a record and fan it out.
    ///
    /// Publishing happens under the history lock so ring order and delivery
    /// order always agree.
    pub fn ingest(&self, record: LogRecord) -> Envelope {
        let mut history = self.history();
        let envelope = history.push(record);
        self.hub.publish(&envelope);
        envelope
    }

    /// Up to `limit` most recent records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Envelope> {
        self.history().snapshot(limit)
    }

    pub fn search(&self, filter: &SearchFilter) -> Vec<Envelope> {
        self.history().search(filter)
    }

    pub fn stats(&self) -> FeedStats {
        FeedStats {
            history: self.history().stats(),
            subscribers: self.hub.subscribers(),
        }
    }

    /// Subscribe, then take a backlog snapshot.
    ///
    /// Subscribing first means nothing ingested in between can be missed;
    /// the overlap is removed by the caller using sequence numbers.
    pub fn join(&self, backlog: usize) -> (Vec<Envelope>, Subscription) {
        let subscription = self.hub.subscribe();
        let snapshot = self.recent(backlog);
        (snapshot, subscription)
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }
}

/// Cursor plus line reassembly for the worker log.
pub struct LogTail {
    cursor: TailCursor,
    splitter: LineSplitter,
    /// Set after `skip_to_tail` landed mid-line; the next line is a fragment.
    skip_fragment: bool,
}

impl LogTail {
    pub fn new(cursor: TailCursor, max_line_bytes: usize) -> Self {
        Self {
            cursor,
            splitter: LineSplitter::new(max_line_bytes),
            skip_fragment: false,
        }
    }

    /// Start from the last `window` bytes of the log instead of its
    /// beginning. Returns how many bytes were skipped.
    pub fn skip_to_tail(&mut self, window: u64) -> Result<u64, TailError> {
        let (skipped, mid_line) = self.cursor.seek_tail(window)?;
        self.skip_fragment = mid_line;
        Ok(skipped)
    }

    pub fn offset(&self) -> u64 {
        self.cursor.offset()
    }

    /// Read everything currently available and ingest each complete line.
    /// Returns the number of records ingested.
    pub fn pump(&mut self, feed: &LogFeed) -> Result<usize, TailError> {
        let mut ingested = 0;
        loop {
            match self.cursor.poll()? {
                Poll::Missing | Poll::Idle => return Ok(ingested),
                Poll::Data { bytes, reset } => {
                    if reset {
                        self.splitter.clear();
                        self.skip_fragment = false;
                    }
                    for line in self.splitter.push(&bytes) {
                        if std::mem::take(&mut self.skip_fragment) {
                            continue;
                        }
                        if let Some(record) = parse_line(&line) {
                            feed.ingest(record);
                            ingested += 1;
                        }
                    }
                }
            }
        }
    }

    /// Like `pump`, then also ingest a trailing line that never got its
    /// newline. Used once the writer is known to be gone.
    pub fn drain(&mut self, feed: &LogFeed) -> Result<usize, TailError> {
        let mut ingested = self.pump(feed)?;
        let last = self.splitter.flush();
        if std::mem::take(&mut self.skip_fragment) {
            return Ok(ingested);
        }
        if let Some(record) = last.as_deref().and_then(parse_line) {
            feed.ingest(record);
            ingested += 1;
        }
        Ok(ingested)
    }
}

pub type SharedTail = Arc<Mutex<LogTail>>;

fn lock_tail(tail: &SharedTail) -> MutexGuard<'_, LogTail> {
    tail.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Run one pump pass on a shared tail, logging instead of failing.
pub fn pump_once(tail: &SharedTail, feed: &LogFeed) -> usize {
    match lock_tail(tail).pump(feed) {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(error = %e, "tail pass failed");
            0
        }
    }
}

/// Final pass after the writer went away.
pub fn drain_once(tail: &SharedTail, feed: &LogFeed) -> usize {
    let mut tail = lock_tail(tail);
    match tail.drain(feed) {
        Ok(n) => {
            if n > 0 {
                tracing::debug!(records = n, offset = tail.offset(), "final tail pass");
            }
            n
        }
        Err(e) => {
            tracing::warn!(error = %e, "final tail pass failed");
            0
        }
    }
}

/// Run a tail pass on the blocking pool; the passes do synchronous file I/O.
pub async fn on_blocking_pool(
    tail: &SharedTail,
    feed: &Arc<LogFeed>,
    pass: fn(&SharedTail, &LogFeed) -> usize,
) -> usize {
    let (tail, feed) = (Arc::clone(tail), Arc::clone(feed));
    match tokio::task::spawn_blocking(move || pass(&tail, &feed)).await {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(error = %e, "tail pass task failed");
            0
        }
    }
}

/// Handle to a running tail loop.
pub struct TailLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TailLoop {
    /// Poll the log every `interval` and feed new lines into `feed`.
    pub fn spawn(tail: SharedTail, feed: Arc<LogFeed>, interval: Duration) -> Self {
        let (shutdown, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            tracing::debug!(interval_ms = interval.as_millis() as u64, "tail loop started");
            loop {
                let n = on_blocking_pool(&tail, &feed, pump_once).await;
                if n > 0 {
                    tracing::trace!(records = n, "tail pass ingested records");
                }
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            tracing::debug!("tail loop stopped");
        });
        Self { shutdown, handle }
    }

    /// Signal the loop to stop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "tail loop task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
