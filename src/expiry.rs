use time::{Duration, OffsetDateTime};

/// Default lifetime of a mapping, measured from its creation.
pub const DEFAULT_TTL: Duration = Duration::hours(24);

/// Source of "now" for every expiry decision.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Decides whether a mapping created at some instant is still live.
///
/// A mapping is expired iff `now > created_at + ttl`; the boundary instant itself is still live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpiryPolicy {
    ttl: Duration,
}

impl ExpiryPolicy {
    #[must_use]
    pub const fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn expires_at(&self, created_at: OffsetDateTime) -> OffsetDateTime {
        created_at.saturating_add(self.ttl)
    }

    #[must_use]
    pub fn is_expired(&self, created_at: OffsetDateTime, now: OffsetDateTime) -> bool {
        now > self.expires_at(created_at)
    }

    /// Rows created strictly before this instant are expired at `now`.
    #[must_use]
    pub fn cutoff(&self, now: OffsetDateTime) -> OffsetDateTime {
        now.saturating_sub(self.ttl)
    }
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}
