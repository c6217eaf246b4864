//! nbformat text fields: either one string or an array of lines.
//!
//! Both shapes are legal on disk. The shape read is the shape written so an
//! untouched document serializes back to the same bytes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MultilineString {
    Single(String),
    Lines(Vec<String>),
}

impl Default for MultilineString {
    fn default() -> Self {
        MultilineString::Lines(Vec::new())
    }
}

impl MultilineString {
    /// Build the line-array form, keeping each line's trailing newline.
    pub fn from_text(text: &str) -> Self {
        MultilineString::Lines(source_to_lines(text))
    }

    /// The joined text, regardless of on-disk shape.
    pub fn text(&self) -> String {
        match self {
            MultilineString::Single(s) => s.clone(),
            MultilineString::Lines(lines) => lines.concat(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MultilineString::Single(s) => s.is_empty(),
            MultilineString::Lines(lines) => lines.iter().all(|l| l.is_empty()),
        }
    }

    /// Convert to the line-array form Jupyter writes for text fields.
    pub fn into_lines(self) -> Self {
        match self {
            MultilineString::Single(s) => MultilineString::from_text(&s),
            lines => lines,
        }
    }

    /// Read a JSON value that should be a string or an array of strings.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(MultilineString::Single(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .map(MultilineString::Lines),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            MultilineString::Single(s) => Value::String(s.clone()),
            MultilineString::Lines(lines) => {
                Value::Array(lines.iter().cloned().map(Value::String).collect())
            }
        }
    }
}

impl From<&str> for MultilineString {
    fn from(text: &str) -> Self {
        MultilineString::from_text(text)
    }
}

/// Split source into lines with their newlines attached.
pub fn source_to_lines(source: &str) -> Vec<String> {
    if source.is_empty() {
        return Vec::new();
    }
    source.split_inclusive('\n').map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_source_to_lines_handles_empty_string() {
        assert!(source_to_lines("").is_empty());
    }

    #[test]
    fn test_source_to_lines_preserves_trailing_newline() {
        assert_eq!(source_to_lines("a\nb\n"), vec!["a\n", "b\n"]);
        assert_eq!(source_to_lines("a\nb"), vec!["a\n", "b"]);
    }

    #[test]
    fn test_text_joins_lines() {
        let text = MultilineString::Lines(vec!["x = 1\n".into(), "x".into()]);
        assert_eq!(text.text(), "x = 1\nx");
    }

    #[test]
    fn test_from_value_keeps_shape() {
        let single = MultilineString::from_value(&json!("hello\n")).unwrap();
        assert_eq!(single.to_value(), json!("hello\n"));

        let lines = MultilineString::from_value(&json!(["a\n", "b"])).unwrap();
        assert_eq!(lines.to_value(), json!(["a\n", "b"]));
    }

    #[test]
    fn test_from_value_rejects_non_text() {
        assert!(MultilineString::from_value(&json!(42)).is_none());
        assert!(MultilineString::from_value(&json!(["a", 1])).is_none());
    }

    #[test]
    fn test_into_lines_splits_single_string() {
        let text = MultilineString::Single("2\n3\n".into()).into_lines();
        assert_eq!(text, MultilineString::Lines(vec!["2\n".into(), "3\n".into()]));
    }
}
