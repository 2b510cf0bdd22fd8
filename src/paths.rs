//! Dot-notation key paths over the JSON document.
//!
//! A key like `window.bounds.width` addresses nested properties; `\.`
//! escapes a literal dot inside a segment. Escapes are resolved once at
//! parse time into a small path AST, and the unsafe segment names
//! (`__proto__`, `prototype`, `constructor`) are refused right there
//! rather than re-checked at every call site.

use serde_json::{Map, Value};

use crate::error::{Result, StoreError};

const UNSAFE_SEGMENTS: [&str; 3] = ["__proto__", "prototype", "constructor"];

/// A parsed key path: ordered segments with escapes already applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath {
    segments: Vec<String>,
}

impl KeyPath {
    /// Parse `key` as dot notation with `\.` escapes.
    pub fn parse(key: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut chars = key.chars();
        while let Some(ch) = chars.next() {
            match ch {
                '\\' => match chars.next() {
                    // Only the dot is escapable; a stray backslash is literal.
                    Some('.') => current.push('.'),
                    Some(other) => {
                        current.push('\\');
                        current.push(other);
                    }
                    None => current.push('\\'),
                },
                '.' => segments.push(std::mem::take(&mut current)),
                _ => current.push(ch),
            }
        }
        segments.push(current);
        Self::from_segments(segments)
    }

    /// Treat the whole key as one literal segment (dot notation disabled).
    pub fn literal(key: &str) -> Result<Self> {
        Self::from_segments(vec![key.to_owned()])
    }

    fn from_segments(segments: Vec<String>) -> Result<Self> {
        for segment in &segments {
            if UNSAFE_SEGMENTS.contains(&segment.as_str()) {
                return Err(StoreError::InvalidKey {
                    reason: format!("unsafe path segment `{segment}`"),
                });
            }
        }
        Ok(Self { segments })
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// First segment, used for the reserved-namespace check.
    #[must_use]
    pub fn head(&self) -> &str {
        self.segments.first().map_or("", String::as_str)
    }
}

/// Iterative descent; `None` when any intermediate step is missing or not
/// an object.
#[must_use]
pub fn get_path<'doc>(doc: &'doc Map<String, Value>, path: &KeyPath) -> Option<&'doc Value> {
    let (last, parents) = path.segments().split_last()?;
    let mut current = doc;
    for segment in parents {
        current = current.get(segment)?.as_object()?;
    }
    current.get(last)
}

#[must_use]
pub fn has_path(doc: &Map<String, Value>, path: &KeyPath) -> bool {
    get_path(doc, path).is_some()
}

/// Set the value at `path`, creating intermediate objects as needed. An
/// intermediate that exists but is not an object is replaced by one.
pub fn set_path(doc: &mut Map<String, Value>, path: &KeyPath, value: Value) {
    let Some((last, parents)) = path.segments().split_last() else {
        return;
    };
    let mut current = doc;
    for segment in parents {
        let entry = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        // Just inserted or replaced above, so this always matches.
        let Value::Object(next) = entry else { return };
        current = next;
    }
    current.insert(last.clone(), value);
}

/// Delete the value at `path`. Returns whether anything was removed;
/// missing intermediates are a no-op.
pub fn delete_path(doc: &mut Map<String, Value>, path: &KeyPath) -> bool {
    let Some((last, parents)) = path.segments().split_last() else {
        return false;
    };
    let mut current = doc;
    for segment in parents {
        let Some(next) = current.get_mut(segment).and_then(Value::as_object_mut) else {
            return false;
        };
        current = next;
    }
    current.remove(last).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn parses_plain_and_nested_keys() {
        assert_eq!(KeyPath::parse("theme").unwrap().segments(), ["theme"]);
        assert_eq!(
            KeyPath::parse("window.bounds.width").unwrap().segments(),
            ["window", "bounds", "width"]
        );
    }

    #[test]
    fn escaped_dots_stay_in_one_segment() {
        assert_eq!(
            KeyPath::parse(r"servers.example\.com.port").unwrap().segments(),
            ["servers", "example.com", "port"]
        );
    }

    #[test]
    fn unsafe_segments_are_rejected_at_parse_time() {
        for key in ["__proto__.x", "a.prototype.b", "constructor"] {
            let err = KeyPath::parse(key).unwrap_err();
            assert!(matches!(err, StoreError::InvalidKey { .. }), "{key}");
        }
    }

    #[test]
    fn literal_mode_keeps_dots_but_still_rejects_unsafe_names() {
        assert_eq!(
            KeyPath::literal("a.b.c").unwrap().segments(),
            ["a.b.c"]
        );
        assert!(KeyPath::literal("__proto__").is_err());
    }

    #[test]
    fn get_set_delete_round_trip() {
        let mut store = doc(json!({}));
        let path = KeyPath::parse("a.b.c").unwrap();
        set_path(&mut store, &path, json!(42));
        assert_eq!(get_path(&store, &path), Some(&json!(42)));
        assert!(has_path(&store, &path));
        assert!(delete_path(&mut store, &path));
        assert!(!has_path(&store, &path));
        assert!(!delete_path(&mut store, &path));
    }

    #[test]
    fn set_replaces_scalar_intermediates_with_objects() {
        let mut store = doc(json!({"a": 1}));
        set_path(&mut store, &KeyPath::parse("a.b").unwrap(), json!(2));
        assert_eq!(
            get_path(&store, &KeyPath::parse("a.b").unwrap()),
            Some(&json!(2))
        );
    }

    #[test]
    fn get_through_a_scalar_is_none() {
        let store = doc(json!({"a": 1}));
        assert_eq!(get_path(&store, &KeyPath::parse("a.b").unwrap()), None);
    }
}
