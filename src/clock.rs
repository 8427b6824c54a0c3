use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Source of wall-clock time in the channel's configured time zone.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Tz>;
}

/// The system clock, viewed through a fixed IANA time zone.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    tz: Tz,
}

impl SystemClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }
}
