//! Wall-clock access in the authority's reference timezone.
use chrono::{DateTime, FixedOffset, Utc};

/// Source of "now". Injected so timestamp rules can be tested.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Reference offset: central Mexico has stayed on UTC-06:00 all year since 2022.
pub fn default_offset() -> FixedOffset {
    FixedOffset::west_opt(6 * 3600).expect("-06:00 is a valid offset")
}
