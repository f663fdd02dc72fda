// SPDX-License-Identifier: GPL-2.0-or-later

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::{
    ops::Deref,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

pub const NANOSECOND: i64 = 1;
pub const MICROSECOND: i64 = NANOSECOND * 1000;
pub const MILLISECOND: i64 = MICROSECOND * 1000;
pub const SECOND: i64 = MILLISECOND * 1000;
pub const MINUTE: i64 = SECOND * 60;
pub const HOUR: i64 = MINUTE * 60;

// Nanoseconds since the Unix epoch.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnixNano(i64);

impl UnixNano {
    #[must_use]
    pub const fn new(v: i64) -> Self {
        Self(v)
    }

    #[must_use]
    pub fn now() -> Self {
        Self(
            i64::try_from(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .expect("time went backwards")
                    .as_nanos(),
            )
            .expect("timestamp to fit i64"),
        )
    }

    #[must_use]
    pub fn add_duration(&self, duration: Duration) -> Option<Self> {
        Some(Self(self.0.checked_add(*duration)?))
    }

    #[must_use]
    pub fn sub_duration(&self, duration: Duration) -> Option<Self> {
        Some(Self(self.0.checked_sub(*duration)?))
    }

    // Reports whether the time instant `self` is after `other`.
    #[must_use]
    pub fn after(&self, other: Self) -> bool {
        self.0 > other.0
    }

    // Reports whether the time instant `self` is before `other`.
    #[must_use]
    pub fn before(&self, other: Self) -> bool {
        self.0 < other.0
    }

    // Returns the duration self - u.
    #[must_use]
    pub fn sub(&self, u: Self) -> Option<Duration> {
        self.0.checked_sub(u.0).map(Duration)
    }

    #[must_use]
    pub fn as_chrono(&self) -> Option<NaiveDateTime> {
        let sec = self.0 / SECOND;
        let nsec = u32::try_from(self.0 % SECOND).ok()?;
        chrono::DateTime::from_timestamp(sec, nsec).map(|v| v.naive_utc())
    }

    pub const MAX: UnixNano = UnixNano(i64::MAX);
}

impl From<i64> for UnixNano {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl Deref for UnixNano {
    type Target = i64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// `std::time::Duration` but signed and without the u128 conversions.
#[repr(transparent)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Duration(i64);

impl Duration {
    #[must_use]
    pub const fn new(nanos: i64) -> Self {
        Self(nanos)
    }

    #[must_use]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[must_use]
    pub fn from_millis(millis: u32) -> Self {
        Self(i64::from(millis) * MILLISECOND)
    }

    #[must_use]
    pub fn from_secs(secs: u32) -> Self {
        Self(i64::from(secs) * SECOND)
    }

    #[must_use]
    pub fn from_minutes(minutes: u32) -> Self {
        Self(i64::from(minutes) * MINUTE)
    }

    #[must_use]
    pub fn from_hours(hours: u32) -> Self {
        Self(i64::from(hours) * HOUR)
    }

    #[allow(
        clippy::as_conversions,
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss
    )]
    #[must_use]
    pub fn from_secs_f64(secs: f64) -> Self {
        Self((secs * SECOND as f64) as i64)
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn checked_add(&self, rhs: Self) -> Option<Self> {
        Some(Self(self.0.checked_add(rhs.0)?))
    }

    #[must_use]
    pub fn checked_sub(&self, rhs: Self) -> Option<Self> {
        Some(Self(self.0.checked_sub(rhs.0)?))
    }

    #[must_use]
    pub fn saturating_sub(&self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    #[allow(clippy::as_conversions, clippy::cast_precision_loss)]
    #[must_use]
    pub fn as_secs_f64(&self) -> f64 {
        let sec = self.0 / SECOND;
        let nsec = self.0 % SECOND;
        (sec as f64) + (nsec as f64) / (SECOND as f64)
    }

    // Seconds rounded up. `#EXT-X-TARGETDURATION` wants the integer ceiling.
    #[must_use]
    pub fn as_secs_ceil(&self) -> i64 {
        if self.0 <= 0 {
            return 0;
        }
        (self.0 + (SECOND - 1)) / SECOND
    }

    #[must_use]
    pub fn as_millis(&self) -> i64 {
        self.0 / MILLISECOND
    }

    #[must_use]
    pub fn as_std(&self) -> Option<std::time::Duration> {
        Some(std::time::Duration::from_nanos(u64::try_from(self.0).ok()?))
    }
}

impl From<i64> for Duration {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl Deref for Duration {
    type Target = i64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Time source. Injected so tests can control the clock.
pub trait Clock {
    fn now(&self) -> UnixNano;
}

pub type ArcClock = Arc<dyn Clock + Send + Sync>;

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixNano {
        UnixNano::now()
    }
}

#[must_use]
pub fn new_system_clock() -> ArcClock {
    Arc::new(SystemClock)
}

// Clock that only advances when told to.
pub struct ManualClock(std::sync::Mutex<UnixNano>);

impl ManualClock {
    #[must_use]
    pub fn new(start: UnixNano) -> Arc<Self> {
        Arc::new(Self(std::sync::Mutex::new(start)))
    }

    pub fn set(&self, now: UnixNano) {
        *self.0.lock().expect("not poisoned") = now;
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.0.lock().expect("not poisoned");
        *now = now.add_duration(duration).expect("clock to not overflow");
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixNano {
        *self.0.lock().expect("not poisoned")
    }
}
