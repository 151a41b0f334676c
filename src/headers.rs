//! Ordered header list shared by items and protocol requests.
//!
//! Unlike a map, [`Headers`] preserves insertion order so persisted items
//! replay their headers exactly as they were supplied. Keys are compared
//! exactly; the Manager's resume merge relies on [`Headers::update`]
//! (insert-if-missing, overwrite-if-present) so each distinct key appears
//! at most once unless [`Headers::add`] was used deliberately.

use serde::{Deserialize, Serialize};

/// One header entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    /// Header name.
    pub key: String,
    /// Header value.
    pub value: String,
}

/// Ordered sequence of header entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<HeaderEntry>);

impl Headers {
    /// Creates an empty header list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a header list from `(key, value)` pairs, preserving order.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut headers = Self::new();
        for (key, value) in pairs {
            headers.add(key, value);
        }
        headers
    }

    /// Looks up a key, returning its index and value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<(usize, &str)> {
        self.0
            .iter()
            .enumerate()
            .find(|(_, e)| e.key == key)
            .map(|(i, e)| (i, e.value.as_str()))
    }

    /// Inserts the key if missing, overwrites its value if present.
    pub fn update(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|e| e.key == key) {
            Some(entry) => entry.value = value,
            None => self.0.push(HeaderEntry { key, value }),
        }
    }

    /// Inserts the key only when it is not present yet.
    pub fn init_or_update(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if self.get(&key).is_none() {
            self.0.push(HeaderEntry {
                key,
                value: value.into(),
            });
        }
    }

    /// Appends an entry unconditionally. The only way duplicate keys can
    /// enter the list.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push(HeaderEntry {
            key: key.into(),
            value: value.into(),
        });
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|e| (e.key.as_str(), e.value.as_str()))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a HeaderEntry;
    type IntoIter = std::slice::Iter<'a, HeaderEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_get_returns_index_and_value() {
        let headers = Headers::from_pairs([("Accept", "*/*"), ("Range", "bytes=0-1")]);
        assert_eq!(headers.get("Accept"), Some((0, "*/*")));
        assert_eq!(headers.get("Range"), Some((1, "bytes=0-1")));
        assert_eq!(headers.get("Cookie"), None);
    }

    #[test]
    fn test_update_inserts_when_missing() {
        let mut headers = Headers::new();
        headers.update("User-Agent", "warp");
        assert_eq!(headers.get("User-Agent"), Some((0, "warp")));
    }

    #[test]
    fn test_update_overwrites_in_place() {
        let mut headers = Headers::from_pairs([("A", "1"), ("B", "2")]);
        headers.update("A", "3");
        assert_eq!(headers.get("A"), Some((0, "3")));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_update_keeps_each_key_once_with_last_value() {
        let mut headers = Headers::new();
        for (k, v) in [("A", "1"), ("B", "2"), ("A", "3"), ("C", "4"), ("B", "5")] {
            headers.update(k, v);
        }
        assert_eq!(headers.len(), 3);
        assert_eq!(headers.get("A"), Some((0, "3")));
        assert_eq!(headers.get("B"), Some((1, "5")));
        assert_eq!(headers.get("C"), Some((2, "4")));
    }

    #[test]
    fn test_init_or_update_does_not_overwrite() {
        let mut headers = Headers::from_pairs([("A", "1")]);
        headers.init_or_update("A", "2");
        headers.init_or_update("B", "3");
        assert_eq!(headers.get("A"), Some((0, "1")));
        assert_eq!(headers.get("B"), Some((1, "3")));
    }

    #[test]
    fn test_add_permits_duplicates() {
        let mut headers = Headers::new();
        headers.add("Cookie", "a=1");
        headers.add("Cookie", "b=2");
        assert_eq!(headers.len(), 2);
        // get returns the first occurrence
        assert_eq!(headers.get("Cookie"), Some((0, "a=1")));
    }

    #[test]
    fn test_serde_preserves_order() {
        let headers = Headers::from_pairs([("Z", "1"), ("A", "2"), ("M", "3")]);
        let json = serde_json::to_string(&headers).unwrap();
        let parsed: Headers = serde_json::from_str(&json).unwrap();
        let keys: Vec<_> = parsed.iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(keys, ["Z", "A", "M"]);
    }
}
