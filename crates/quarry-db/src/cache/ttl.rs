//! Time-to-live and expiry.
//!
//! [`Ttl`] is what gets configured; [`Expiry`] is what an in-process entry
//! stores. "Never" is its own variant in both, so a zero or negative number
//! of seconds is never confused with "already expired".

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use crate::error::DbError;

/// How long a populated entry stays readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "TtlRepr")]
pub enum Ttl {
    /// The entry never expires.
    Never,
    /// The entry expires after this long.
    After(Duration),
}

impl Ttl {
    /// A TTL of `secs` seconds; negative values mean [`Ttl::Never`].
    pub fn from_secs(secs: i64) -> Self {
        u64::try_from(secs).map_or(Self::Never, |s| Self::After(Duration::from_secs(s)))
    }

    /// Whether entries with this TTL would be unreadable the moment they
    /// are written.
    pub const fn is_zero(self) -> bool {
        matches!(self, Self::After(d) if d.is_zero())
    }

    /// The expiry of an entry written at `now`.
    ///
    /// A deadline past the clock's range is treated as never.
    pub fn expiry_from(self, now: Instant) -> Expiry {
        match self {
            Self::Never => Expiry::Never,
            Self::After(d) => now.checked_add(d).map_or(Expiry::Never, Expiry::At),
        }
    }

    /// Whole milliseconds for networked tiers, `None` for never.
    pub fn as_millis(self) -> Option<i64> {
        match self {
            Self::Never => None,
            Self::After(d) => Some(i64::try_from(d.as_millis()).unwrap_or(i64::MAX)),
        }
    }
}

impl Default for Ttl {
    fn default() -> Self {
        Self::After(Duration::from_secs(60))
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("never"),
            Self::After(d) => write!(f, "{}ms", d.as_millis()),
        }
    }
}

impl FromStr for Ttl {
    type Err = DbError;

    /// Parses `never`, a signed number of seconds, `<n>s`, or `<n>ms`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("never") {
            return Ok(Self::Never);
        }
        let invalid = |e: std::num::ParseIntError| {
            DbError::Config(format!("invalid TTL `{s}` (expected never, <secs>, <n>s or <n>ms): {e}"))
        };
        if let Some(ms) = s.strip_suffix("ms") {
            let ms: u64 = ms.trim().parse().map_err(invalid)?;
            return Ok(Self::After(Duration::from_millis(ms)));
        }
        let secs = s.strip_suffix('s').unwrap_or(s);
        secs.trim().parse::<i64>().map(Self::from_secs).map_err(invalid)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TtlRepr {
    Secs(i64),
    Text(String),
}

impl TryFrom<TtlRepr> for Ttl {
    type Error = DbError;

    fn try_from(repr: TtlRepr) -> Result<Self, Self::Error> {
        match repr {
            TtlRepr::Secs(secs) => Ok(Self::from_secs(secs)),
            TtlRepr::Text(text) => text.parse(),
        }
    }
}

/// Expiry of an in-process cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Never expires.
    Never,
    /// Expires at this instant.
    At(Instant),
}

impl Expiry {
    /// Whether the entry is expired at `now`.
    pub fn is_expired(self, now: Instant) -> bool {
        match self {
            Self::Never => false,
            Self::At(deadline) => now >= deadline,
        }
    }
}
