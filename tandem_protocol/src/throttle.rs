// Rate limiting for repetitive log lines.
//
// A peer that falls behind can drop hundreds of stale realtime envelopes per
// second. Logging each one would drown everything else, so drop warnings go
// through a `Throttler` that admits at most one line per interval.
// `KindThrottle` keeps one throttler per message kind.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::message::MessageKind;

#[derive(Debug)]
pub struct Throttler {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl Throttler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    /// True if the caller may emit now. Counts suppressed calls otherwise.
    pub fn tick(&mut self, now: Instant) -> bool {
        let ready = match self.last {
            Some(last) => now.saturating_duration_since(last) >= self.interval,
            None => true,
        };
        if ready {
            self.last = Some(now);
        } else {
            self.suppressed += 1;
        }
        ready
    }

    /// Suppressed calls since the last admitted one; resets the count.
    pub fn take_suppressed(&mut self) -> u64 {
        std::mem::take(&mut self.suppressed)
    }
}

/// Independent throttling per message kind.
#[derive(Debug)]
pub struct KindThrottle {
    interval: Duration,
    by_kind: HashMap<MessageKind, Throttler>,
}

impl KindThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            by_kind: HashMap::new(),
        }
    }

    pub fn tick(&mut self, kind: MessageKind, now: Instant) -> bool {
        let interval = self.interval;
        self.by_kind
            .entry(kind)
            .or_insert_with(|| Throttler::new(interval))
            .tick(now)
    }

    pub fn take_suppressed(&mut self, kind: MessageKind) -> u64 {
        self.by_kind
            .get_mut(&kind)
            .map_or(0, Throttler::take_suppressed)
    }
}
