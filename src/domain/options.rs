//! Compact render options.
//!
//! Cards accept extra template parameters as a single compact string such as
//! `font_serif-size_big`: segments are separated by `-` and each segment holds a
//! key and a value separated by the first `_`. Parsed options keep their input
//! order; when a key repeats, the last value wins and keeps the position of the
//! first occurrence.

use std::fmt;

use super::error::RequestError;

const SEGMENT_DELIMITER: char = '-';
const PAIR_DELIMITER: char = '_';

/// Ordered, de-duplicated template parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct OptionSet {
    pairs: Vec<(String, String)>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the compact `key_value-key_value` form.
    pub fn parse(raw: &str) -> Result<Self, RequestError> {
        let mut options = Self::new();
        if raw.is_empty() {
            return Ok(options);
        }

        for segment in raw.split(SEGMENT_DELIMITER) {
            let (key, value) = segment
                .split_once(PAIR_DELIMITER)
                .ok_or_else(|| RequestError::malformed_options(segment))?;
            if key.is_empty() {
                return Err(RequestError::malformed_options(segment));
            }
            options.insert(key, value);
        }

        Ok(options)
    }

    /// Insert a pair; an existing key keeps its position and takes the new value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.pairs.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => *slot = value,
            None => self.pairs.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Serialize as a query string (`k=v&k=v`), percent-encoding keys and values.
    ///
    /// An empty set yields an empty string.
    pub fn to_query(&self) -> String {
        self.pairs
            .iter()
            .map(|(key, value)| {
                format!(
                    "{}={}",
                    urlencoding::encode(key),
                    urlencoding::encode(value)
                )
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Serialize back into the compact form accepted by [`OptionSet::parse`].
    ///
    /// Keys containing `-` or `_` and values containing `-` cannot be expressed
    /// compactly and are skipped.
    pub fn to_compact(&self) -> String {
        self.pairs
            .iter()
            .filter(|(key, value)| {
                !key.contains([SEGMENT_DELIMITER, PAIR_DELIMITER])
                    && !value.contains(SEGMENT_DELIMITER)
            })
            .map(|(key, value)| format!("{key}{PAIR_DELIMITER}{value}"))
            .collect::<Vec<_>>()
            .join("-")
    }
}

impl fmt::Display for OptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query())
    }
}

impl<K, V> FromIterator<(K, V)> for OptionSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut options = Self::new();
        for (key, value) in iter {
            options.insert(key, value);
        }
        options
    }
}
