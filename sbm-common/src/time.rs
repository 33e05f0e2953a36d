use std::convert::TryFrom;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::{de, Deserialize, Deserializer, Serialize};
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::OffsetDateTime;

/// The number of milliseconds since the [`UNIX_EPOCH`].
///
/// - Internally represented by a non-negative [`i64`] to ease interoperability
///   with some platforms we use which don't support unsigned ints.
/// - Can represent any time from January 1st, 1970 00:00:00.000 UTC to roughly
///   292 million years in the future.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
pub struct TimestampMillis(i64);

impl TimestampMillis {
    /// Creates a new [`TimestampMillis`] from the current [`SystemTime`].
    ///
    /// Panics if the current time is not within bounds.
    pub fn now() -> Self {
        Self::try_from(SystemTime::now()).unwrap()
    }

    /// Returns the contained [`i64`].
    pub fn as_i64(self) -> i64 {
        self.0
    }

    /// Wraps a raw epoch-millisecond value, rejecting negative inputs.
    pub fn from_millis_checked(millis: i64) -> Option<Self> {
        (millis >= 0).then_some(Self(millis))
    }

    /// Parses an RFC3339 timestamp (e.g. an email `Date` header or a
    /// provider API's transaction time) into a [`TimestampMillis`].
    pub fn parse_rfc3339(s: &str) -> anyhow::Result<Self> {
        let odt = OffsetDateTime::parse(s, &Rfc3339)
            .with_context(|| format!("invalid RFC3339 timestamp: {s}"))?;
        let millis = odt.unix_timestamp_nanos() / 1_000_000;
        let millis = i64::try_from(millis)
            .context("RFC3339 timestamp out of i64 millisecond range")?;
        if millis < 0 {
            anyhow::bail!("RFC3339 timestamp is before the Unix epoch: {s}");
        }
        Ok(Self(millis))
    }

    /// Parses an RFC2822 timestamp (an IMAP `ENVELOPE`'s `Date` header) into
    /// a [`TimestampMillis`].
    pub fn parse_rfc2822(s: &str) -> anyhow::Result<Self> {
        let odt = OffsetDateTime::parse(s, &Rfc2822)
            .with_context(|| format!("invalid RFC2822 timestamp: {s}"))?;
        let millis = odt.unix_timestamp_nanos() / 1_000_000;
        let millis = i64::try_from(millis)
            .context("RFC2822 timestamp out of i64 millisecond range")?;
        if millis < 0 {
            anyhow::bail!("RFC2822 timestamp is before the Unix epoch: {s}");
        }
        Ok(Self(millis))
    }

    /// Formats this timestamp as an RFC3339 string in UTC.
    pub fn to_rfc3339(self) -> anyhow::Result<String> {
        let odt = OffsetDateTime::from(SystemTime::from(self));
        odt.format(&Rfc3339)
            .context("failed to format timestamp as RFC3339")
    }
}

/// Get a [`SystemTime`] corresponding to this timestamp.
impl From<TimestampMillis> for SystemTime {
    fn from(timestamp: TimestampMillis) -> Self {
        let timestamp_u64 = u64::try_from(timestamp.0)
            .expect("Non-negative invariant was violated");
        let duration_since_epoch = Duration::from_millis(timestamp_u64);
        UNIX_EPOCH + duration_since_epoch
    }
}

/// Attempts to convert a [`SystemTime`] into a [`TimestampMillis`].
///
/// Returns an error if the [`SystemTime`] is not within bounds.
impl TryFrom<SystemTime> for TimestampMillis {
    type Error = anyhow::Error;
    fn try_from(system_time: SystemTime) -> anyhow::Result<Self> {
        system_time
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis())
            .map(i64::try_from)
            .map(|res| res.map(Self))
            .context("Current time is before January 1st, 1970")?
            .context("Current time is more than 292 million years past epoch")
    }
}

/// Enforces that the inner [`i64`] is non-negative.
impl<'de> Deserialize<'de> for TimestampMillis {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = i64::deserialize(deserializer)?;
        if value >= 0 {
            Ok(TimestampMillis(value))
        } else {
            Err(de::Error::invalid_value(
                de::Unexpected::Signed(value),
                &"Unix timestamp must be non-negative",
            ))
        }
    }
}
