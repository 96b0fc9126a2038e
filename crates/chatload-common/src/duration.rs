//! Human-friendly durations (`500ms`, `10s`, `2m`, `1h`) used by stage and
//! timing settings in config files.

use std::time::Duration;

use crate::{ChatloadError, Result};

pub fn parse(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| ChatloadError::Duration(s.to_string()))?;
    let (value, unit) = s.split_at(split);
    let value: u64 = value.parse().map_err(|_| ChatloadError::Duration(s.to_string()))?;
    let secs = match unit {
        "ms" => return Ok(Duration::from_millis(value)),
        "s" => Some(value),
        "m" => value.checked_mul(60),
        "h" => value.checked_mul(60 * 60),
        _ => return Err(ChatloadError::Duration(s.to_string())),
    };
    secs.map(Duration::from_secs).ok_or_else(|| ChatloadError::Duration(s.to_string()))
}

/// Inverse of [`parse`], picking the largest unit that divides evenly.
pub fn format(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        return "0s".into();
    }
    if ms % 1000 != 0 {
        return format!("{}ms", ms);
    }
    let secs = d.as_secs();
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// `#[serde(with = "chatload_common::duration::serde")]` support.
pub mod serde {
    use std::time::Duration;

    use ::serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(d)?;
        super::parse(&text).map_err(D::Error::custom)
    }
}
