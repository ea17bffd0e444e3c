//! Stream versions and the optimistic-concurrency expectation attached to
//! every append.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Sentinel: the stream must not exist yet.
pub const NEW_STREAM: i64 = -1;
/// Sentinel: skip the concurrency check.
pub const ANY: i64 = -2;
/// Sentinel: the stream must not exist (alias used by some backends).
pub const NO_STREAM: i64 = -3;

/// The version a writer expects a stream to be at when appending.
///
/// Stream positions are zero-based, so a stream holding `n` events is at
/// version `n - 1` and an empty stream is at [`NEW_STREAM`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum ExpectedVersion {
    /// The stream must not contain any events.
    NewStream,
    /// No concurrency check is performed.
    Any,
    /// The stream must not exist.
    NoStream,
    /// The last event of the stream must be at exactly this position.
    Exact(i64),
}

impl ExpectedVersion {
    /// Returns the expectation for an aggregate last seen at `version`.
    pub fn after(version: i64) -> Self {
        if version < 0 {
            Self::NewStream
        } else {
            Self::Exact(version)
        }
    }

    /// Encodes the expectation as a signed integer using the sentinels of this
    /// module.
    pub fn as_i64(self) -> i64 {
        match self {
            Self::NewStream => NEW_STREAM,
            Self::Any => ANY,
            Self::NoStream => NO_STREAM,
            Self::Exact(v) => v,
        }
    }

    /// Checks the expectation against the last position of a stream (`None`
    /// when the stream holds no events).
    pub fn matches(self, actual: Option<i64>) -> bool {
        match self {
            Self::Any => true,
            Self::NewStream | Self::NoStream => actual.is_none(),
            Self::Exact(v) => actual == Some(v),
        }
    }
}

impl TryFrom<i64> for ExpectedVersion {
    type Error = Error;

    /// Fails for negative values other than the sentinels, which no stream
    /// position could ever match.
    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            NEW_STREAM => Ok(Self::NewStream),
            ANY => Ok(Self::Any),
            NO_STREAM => Ok(Self::NoStream),
            v if v >= 0 => Ok(Self::Exact(v)),
            v => Err(Error::InvalidArgument(format!(
                "{v} is neither a stream position nor a version sentinel"
            ))),
        }
    }
}

impl From<ExpectedVersion> for i64 {
    fn from(value: ExpectedVersion) -> Self {
        value.as_i64()
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewStream => f.write_str("new stream"),
            Self::Any => f.write_str("any"),
            Self::NoStream => f.write_str("no stream"),
            Self::Exact(v) => write!(f, "{v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_round_trip_through_i64() {
        for v in [NEW_STREAM, ANY, NO_STREAM, 0, 41] {
            assert_eq!(ExpectedVersion::try_from(v).expect("valid").as_i64(), v);
        }
        assert_eq!(ExpectedVersion::try_from(7).expect("valid"), ExpectedVersion::Exact(7));
    }

    #[test]
    fn unknown_negative_values_are_rejected() {
        let err = ExpectedVersion::try_from(-7).expect_err("not a sentinel");
        assert!(matches!(err, Error::InvalidArgument(_)));

        let parsed = serde_json::from_str::<ExpectedVersion>("-7");
        assert!(parsed.is_err());
        let parsed: ExpectedVersion = serde_json::from_str("-2").expect("sentinel");
        assert_eq!(parsed, ExpectedVersion::Any);
    }

    #[test]
    fn matches_follows_cas_rules() {
        assert!(ExpectedVersion::Any.matches(None));
        assert!(ExpectedVersion::Any.matches(Some(3)));
        assert!(ExpectedVersion::NewStream.matches(None));
        assert!(!ExpectedVersion::NewStream.matches(Some(0)));
        assert!(ExpectedVersion::NoStream.matches(None));
        assert!(ExpectedVersion::Exact(2).matches(Some(2)));
        assert!(!ExpectedVersion::Exact(2).matches(Some(3)));
        assert!(!ExpectedVersion::Exact(0).matches(None));
    }

    #[test]
    fn after_maps_unsaved_aggregates_to_new_stream() {
        assert_eq!(ExpectedVersion::after(-1), ExpectedVersion::NewStream);
        assert_eq!(ExpectedVersion::after(4), ExpectedVersion::Exact(4));
    }
}
