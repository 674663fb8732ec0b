use tokio::time::{Duration, Instant};

/// Minimum spacing between forwarded ticker updates for one stream key.
pub const TICKER_INTERVAL: Duration = Duration::from_secs(2);

/// Drops events arriving faster than a fixed interval. Values may be dropped
/// but never reordered: every allowed event is newer than the previous one.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last_emit: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    pub fn ticker() -> Self {
        Self::new(TICKER_INTERVAL)
    }

    pub fn allow_at(&mut self, now: Instant) -> bool {
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }

    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }
}
