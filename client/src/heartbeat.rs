//! Round-trip latency and silence tracking for the progress stream.
//!
//! Quality comes from the last measured ping latency, but any stretch of
//! inbound silence overrides it: past `degraded_after` the connection is
//! `Poor`, past `stale_after` it is considered gone for presentation even
//! if the transport still looks open.

use std::collections::VecDeque;
use std::time::Duration;

use strum_macros::Display;
use tokio::time::Instant;

const EXCELLENT_BELOW: Duration = Duration::from_millis(100);
const GOOD_BELOW: Duration = Duration::from_millis(300);
const MAX_PENDING_PINGS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionQuality {
    /// Connected, but no pong measured yet.
    Unknown,
    Excellent,
    Good,
    Poor,
}

pub fn classify_latency(latency: Duration) -> ConnectionQuality {
    if latency < EXCELLENT_BELOW {
        ConnectionQuality::Excellent
    } else if latency < GOOD_BELOW {
        ConnectionQuality::Good
    } else {
        ConnectionQuality::Poor
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Staleness {
    Fresh,
    Degraded,
    Stale,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    degraded_after: Duration,
    stale_after: Duration,
    last_inbound_at: Option<Instant>,
    latency: Option<Duration>,
    reported: Staleness,
    /// Pings awaiting their pong, oldest first.
    pending: VecDeque<(i64, Instant)>,
}

impl HeartbeatMonitor {
    pub fn new(degraded_after: Duration, stale_after: Duration) -> Self {
        Self {
            degraded_after,
            stale_after,
            last_inbound_at: None,
            latency: None,
            reported: Staleness::Fresh,
            pending: VecDeque::new(),
        }
    }

    /// Starts a fresh measurement window for a newly opened connection.
    pub fn reset(&mut self) {
        self.last_inbound_at = Some(Instant::now());
        self.latency = None;
        self.reported = Staleness::Fresh;
        self.pending.clear();
    }

    pub fn ping_sent(&mut self, timestamp_ms: i64) {
        if self.pending.len() == MAX_PENDING_PINGS {
            self.pending.pop_front();
        }
        self.pending.push_back((timestamp_ms, Instant::now()));
    }

    /// Any inbound frame counts, not only pongs.
    pub fn record_inbound(&mut self) {
        self.last_inbound_at = Some(Instant::now());
    }

    /// Records a pong echoing `timestamp_ms` and returns the measured
    /// round trip. Pongs for pings this monitor did not send fall back to
    /// the wall-clock difference.
    pub fn record_pong(&mut self, timestamp_ms: i64, now_ms: i64) -> Duration {
        self.record_inbound();
        let latency = match self.pending.iter().position(|(ts, _)| *ts == timestamp_ms) {
            Some(idx) => {
                let sent_at = self.pending[idx].1;
                self.pending.drain(..=idx);
                sent_at.elapsed()
            }
            None => Duration::from_millis(u64::try_from(now_ms - timestamp_ms).unwrap_or(0)),
        };
        self.latency = Some(latency);
        latency
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn last_inbound_at(&self) -> Option<Instant> {
        self.last_inbound_at
    }

    pub fn silent_for(&self) -> Option<Duration> {
        self.last_inbound_at.map(|at| at.elapsed())
    }

    pub fn staleness(&self) -> Staleness {
        match self.silent_for() {
            Some(silent) if silent >= self.stale_after => Staleness::Stale,
            Some(silent) if silent >= self.degraded_after => Staleness::Degraded,
            _ => Staleness::Fresh,
        }
    }

    pub fn quality(&self) -> ConnectionQuality {
        if self.staleness() != Staleness::Fresh {
            return ConnectionQuality::Poor;
        }
        self.latency
            .map(classify_latency)
            .unwrap_or(ConnectionQuality::Unknown)
    }

    /// Returns the current staleness if it differs from the last value
    /// taken, so each transition is reported once.
    pub fn take_staleness_change(&mut self) -> Option<Staleness> {
        let current = self.staleness();
        if current == self.reported {
            return None;
        }
        self.reported = current;
        Some(current)
    }
}
