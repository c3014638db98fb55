//! Canonical encoding of dimension tag maps.
//!
//! A dimension set narrows a metric stream, e.g. `{"region": "eu", "host": "a"}`.
//! Records are keyed by the canonical string form of their dimensions, so the
//! encoding must not depend on the order in which tags were supplied:
//!
//! ```text
//! {"region": "eu", "host": "a"}  ->  "host=a,region=eu"
//! {}                             ->  ""
//! ```

use std::collections::BTreeMap;
use std::fmt::Display;

use crate::error::{Result, ValidationError};

/// A dimension map. Values are always strings.
///
/// `BTreeMap` keeps keys sorted, which makes [`encode`] deterministic.
pub type Dimensions = BTreeMap<String, String>;

/// Separator between `key=value` pairs.
const PAIR_SEPARATOR: char = ',';

/// Separator between a key and its value.
const KEY_VALUE_SEPARATOR: char = '=';

/// Builds a [`Dimensions`] map from any key/value pairs, coercing values to strings.
///
/// # Examples
///
/// ```rust
/// use tierstat::dimensions::dimensions;
///
/// let dims = dimensions([("shard", 3)]);
/// assert_eq!(dims["shard"], "3");
/// ```
pub fn dimensions<I, K, V>(pairs: I) -> Dimensions
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Display,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.to_string()))
        .collect()
}

/// Encodes a dimension map as `k1=v1,k2=v2` with keys in lexicographic order.
///
/// # Examples
///
/// ```rust
/// use tierstat::dimensions::{dimensions, encode};
///
/// let dims = dimensions([("region", "eu"), ("host", "a")]);
/// assert_eq!(encode(&dims), "host=a,region=eu");
/// assert_eq!(encode(&Default::default()), "");
/// ```
pub fn encode(dimensions: &Dimensions) -> String {
    let mut out = String::new();
    for (key, value) in dimensions {
        if !out.is_empty() {
            out.push(PAIR_SEPARATOR);
        }
        out.push_str(key);
        out.push(KEY_VALUE_SEPARATOR);
        out.push_str(value);
    }
    out
}

/// Decodes a canonical dimension string back into a map.
///
/// Pairs without a `=` are kept with an empty value so that no tag is lost.
pub fn decode(encoded: &str) -> Dimensions {
    if encoded.is_empty() {
        return Dimensions::new();
    }

    encoded
        .split(PAIR_SEPARATOR)
        .map(|pair| match pair.split_once(KEY_VALUE_SEPARATOR) {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// Checks that every tag survives an encode/decode round trip.
///
/// Keys must be non-empty and contain neither `,` nor `=`. Values must not
/// contain `,`.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidDimension`] for the first offending tag.
pub fn validate(dimensions: &Dimensions) -> Result<()> {
    for (key, value) in dimensions {
        let reason = if key.is_empty() {
            Some("key must not be empty")
        } else if key.contains(PAIR_SEPARATOR) || key.contains(KEY_VALUE_SEPARATOR) {
            Some("key must not contain ',' or '='")
        } else if value.contains(PAIR_SEPARATOR) {
            Some("value must not contain ','")
        } else {
            None
        };

        if let Some(reason) = reason {
            return Err(ValidationError::InvalidDimension {
                key: key.clone(),
                value: value.clone(),
                reason: reason.to_string(),
            }
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_is_order_independent() {
        let forward = dimensions([("a", "1"), ("b", "2"), ("c", "3")]);
        let reverse = dimensions([("c", "3"), ("b", "2"), ("a", "1")]);

        assert_eq!(encode(&forward), "a=1,b=2,c=3");
        assert_eq!(encode(&forward), encode(&reverse));
    }

    #[test]
    fn test_decode_inverts_encode() {
        let samples = [
            dimensions::<_, &str, &str>([]),
            dimensions([("host", "web-1")]),
            dimensions([("zone", "us-east-1a"), ("az", "b"), ("tier", "gold")]),
            dimensions([("expr", "a=b")]),
        ];

        for dims in samples {
            assert_eq!(decode(&encode(&dims)), dims);
        }
    }

    #[test]
    fn test_values_are_coerced_to_strings() {
        let dims = dimensions([("port", 8080), ("shard", 7)]);
        let decoded = decode(&encode(&dims));

        assert_eq!(decoded["port"], "8080");
        assert_eq!(decoded["shard"], "7");
    }

    #[test]
    fn test_decode_pair_without_separator() {
        let decoded = decode("flag,host=a");
        assert_eq!(decoded["flag"], "");
        assert_eq!(decoded["host"], "a");
    }

    #[test]
    fn test_validate_rejects_unencodable_tags() {
        assert!(validate(&dimensions([("host", "a")])).is_ok());
        assert!(validate(&dimensions([("", "a")])).is_err());
        assert!(validate(&dimensions([("a,b", "x")])).is_err());
        assert!(validate(&dimensions([("a=b", "x")])).is_err());
        assert!(validate(&dimensions([("host", "a,b")])).is_err());
    }
}
