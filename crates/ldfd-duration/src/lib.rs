//! Duration parsing and serde (de)serialization helpers shared by every
//! `ldfd` crate that takes a human-written timeout, poll cadence, or
//! backoff interval from configuration.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Deserialize a [`Duration`] from either a human-readable string
/// (`"60s"`, `"5m"`, `"1h30m"`) or a raw `u64` count of milliseconds.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a [`Duration`] as milliseconds so it round-trips through
/// [`deserialize_duration`].
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Optional-duration variant used by config fields that default to "no
/// deadline" (e.g. a build's overall timeout, which is open-ended by
/// default per the build manager's stage timeout rules).
pub fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Helper {
        None,
        String(String),
        U64(u64),
    }

    match Option::<Helper>::deserialize(deserializer)? {
        None | Some(Helper::None) => Ok(None),
        Some(Helper::String(s)) => humantime::parse_duration(&s)
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        Some(Helper::U64(ms)) => Ok(Some(Duration::from_millis(ms))),
    }
}

pub fn serialize_duration_opt<S>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match duration {
        Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}

/// Format a duration the way operator-facing log lines and CLI output do
/// elsewhere in `ldfd` (`"1m 30s"` rather than `"90s"`).
pub fn format_duration(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Wrapper {
        #[serde(
            deserialize_with = "deserialize_duration",
            serialize_with = "serialize_duration"
        )]
        d: Duration,
    }

    #[test]
    fn parses_human_readable_string() {
        let w: Wrapper = serde_json::from_str(r#"{"d":"5m"}"#).unwrap();
        assert_eq!(w.d, Duration::from_secs(300));
    }

    #[test]
    fn parses_millis_integer() {
        let w: Wrapper = serde_json::from_str(r#"{"d":1500}"#).unwrap();
        assert_eq!(w.d, Duration::from_millis(1500));
    }

    #[test]
    fn rejects_garbage_string() {
        let err = serde_json::from_str::<Wrapper>(r#"{"d":"not-a-duration"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn round_trips_through_millis() {
        let w = Wrapper {
            d: Duration::from_millis(60_000),
        };
        let json = serde_json::to_string(&w).unwrap();
        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back.d, w.d);
    }

    proptest::proptest! {
        #[test]
        fn round_trip_any_millis(ms in 0u64..1_000_000_000) {
            let w = Wrapper { d: Duration::from_millis(ms) };
            let json = serde_json::to_string(&w).unwrap();
            let back: Wrapper = serde_json::from_str(&json).unwrap();
            proptest::prop_assert_eq!(back.d, w.d);
        }
    }
}
