//! Viewer sessions: one live connection from an operator UI.
//!
//! A session moves `Connecting -> Active -> Closed`. On activation it joins
//! the feed (subscribe first, then snapshot), emits a `connected` greeting,
//! replays the backlog and then streams live records, interleaved with a
//! heartbeat on a fixed period. Live records already covered by the backlog
//! are skipped by sequence number.

use crate::feed::LogFeed;
use crate::hub::Subscription;
use crate::record::Envelope;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerState {
    Connecting,
    Active,
    Closed,
}

/// Everything a viewer receives. Control messages carry a distinct `type`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerMessage {
    Connected {
        message: String,
        backlog: usize,
        timestamp: DateTime<Local>,
    },
    Log(Envelope),
    Heartbeat {
        timestamp: DateTime<Local>,
    },
}

impl ViewerMessage {
    /// Name used for the SSE `event:` field.
    pub fn kind(&self) -> &'static str {
        match self {
            ViewerMessage::Connected { .. } => "connected",
            ViewerMessage::Log(_) => "log",
            ViewerMessage::Heartbeat { .. } => "heartbeat",
        }
    }
}

pub struct ViewerSession {
    state: ViewerState,
    greeting: Option<ViewerMessage>,
    backlog: VecDeque<Envelope>,
    subscription: Option<Subscription>,
    heartbeat: Interval,
    /// Highest seq handed to the viewer so far.
    last_seq: u64,
}

impl ViewerSession {
    /// A session that has not joined the feed yet.
    pub fn new(heartbeat_every: Duration) -> Self {
        let period = heartbeat_every.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            state: ViewerState::Connecting,
            greeting: None,
            backlog: VecDeque::new(),
            subscription: None,
            heartbeat,
            last_seq: 0,
        }
    }

    /// Join `feed` and become active, queueing up to `backlog` recent records.
    pub fn activate(&mut self, feed: &LogFeed, backlog: usize) {
        if self.state != ViewerState::Connecting {
            return;
        }
        let (snapshot, subscription) = feed.join(backlog);
        tracing::info!(
            subscriber = subscription.id(),
            backlog = snapshot.len(),
            "viewer connected"
        );
        self.greeting = Some(ViewerMessage::Connected {
            message: "log stream connected".to_string(),
            backlog: snapshot.len(),
            timestamp: Local::now(),
        });
        self.backlog = snapshot.into();
        self.subscription = Some(subscription);
        self.state = ViewerState::Active;
    }

    /// Shorthand for `new` + `activate`.
    pub fn open(feed: &LogFeed, backlog: usize, heartbeat_every: Duration) -> Self {
        let mut session = Self::new(heartbeat_every);
        session.activate(feed, backlog);
        session
    }

    /// The next message for the viewer, or `None` once the session is
    /// closed (or the feed went away).
    ///
    /// Cancel safe: dropping the future loses no record.
    pub async fn next(&mut self) -> Option<ViewerMessage> {
        if self.state != ViewerState::Active {
            return None;
        }
        if let Some(greeting) = self.greeting.take() {
            return Some(greeting);
        }
        if let Some(envelope) = self.backlog.pop_front() {
            self.last_seq = self.last_seq.max(envelope.seq);
            return Some(ViewerMessage::Log(envelope));
        }

        loop {
            let subscription = self.subscription.as_mut()?;
            tokio::select! {
                received = subscription.recv() => match received {
                    Some(envelope) if envelope.seq <= self.last_seq => continue,
                    Some(envelope) => {
                        self.last_seq = envelope.seq;
                        return Some(ViewerMessage::Log(envelope));
                    }
                    None => {
                        self.close();
                        return None;
                    }
                },
                _ = self.heartbeat.tick() => {
                    return Some(ViewerMessage::Heartbeat { timestamp: Local::now() });
                }
            }
        }
    }

    /// Leave the hub. Idempotent.
    pub fn close(&mut self) {
        if self.state == ViewerState::Closed {
            return;
        }
        if let Some(subscription) = self.subscription.take() {
            tracing::info!(subscriber = subscription.id(), "viewer disconnected");
        }
        self.backlog.clear();
        self.greeting = None;
        self.state = ViewerState::Closed;
    }
}

/// Why a driven session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The feed shut down.
    FeedClosed,
    /// Delivery failed; the remote end is gone.
    SendFailed(String),
    /// Delivery took longer than the send timeout.
    SendTimedOut,
}

/// Where a driven session writes its messages.
pub trait ViewerSink {
    type Error: std::fmt::Display;

    fn send(
        &mut self,
        message: ViewerMessage,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send;
}

impl ViewerSink for tokio::sync::mpsc::Sender<ViewerMessage> {
    type Error = tokio::sync::mpsc::error::SendError<ViewerMessage>;

    async fn send(&mut self, message: ViewerMessage) -> Result<(), Self::Error> {
        tokio::sync::mpsc::Sender::send(self, message).await
    }
}

/// Pump `session` into `sink` until either side gives up. Always leaves the
/// session closed.
pub async fn drive<S: ViewerSink>(
    session: &mut ViewerSession,
    sink: &mut S,
    send_timeout: Duration,
) -> CloseReason {
    let reason = loop {
        let Some(message) = session.next().await else {
            break CloseReason::FeedClosed;
        };
        match tokio::time::timeout(send_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => break CloseReason::SendFailed(e.to_string()),
            Err(_) => break CloseReason::SendTimedOut,
        }
    };
    tracing::debug!(?reason, "viewer session ended");
    session.close();
    reason
}
