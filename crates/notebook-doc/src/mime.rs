//! MIME bundles attached to display_data and execute_result outputs.

use std::collections::BTreeMap;

use base64::prelude::*;
use bytes::Bytes;
use log::warn;
use serde_json::Value;

use crate::multiline::MultilineString;

pub const MIME_JSON: &str = "application/json";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_HTML: &str = "text/html";
pub const MIME_PNG: &str = "image/png";
pub const MIME_SVG: &str = "image/svg+xml";
pub const MIME_PLAIN: &str = "text/plain";

/// Preference order used to pick the primary representation of a bundle.
pub const MIME_PREFERENCE: [&str; 6] = [
    MIME_JSON,
    MIME_MARKDOWN,
    MIME_HTML,
    MIME_PNG,
    MIME_SVG,
    MIME_PLAIN,
];

/// The representation an output should be shown with.
#[derive(Debug, Clone, PartialEq)]
pub enum MimeRepresentation {
    Json(Value),
    Markdown(String),
    Html(String),
    Png(Bytes),
    Svg(String),
    Plain(String),
}

impl MimeRepresentation {
    pub fn mime_type(&self) -> &'static str {
        match self {
            MimeRepresentation::Json(_) => MIME_JSON,
            MimeRepresentation::Markdown(_) => MIME_MARKDOWN,
            MimeRepresentation::Html(_) => MIME_HTML,
            MimeRepresentation::Png(_) => MIME_PNG,
            MimeRepresentation::Svg(_) => MIME_SVG,
            MimeRepresentation::Plain(_) => MIME_PLAIN,
        }
    }
}

/// MIME type → raw payload. Every entry is kept verbatim, including types
/// nothing here knows how to show.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MimeBundle(BTreeMap<String, Value>);

impl MimeBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: &serde_json::Map<String, Value>) -> Self {
        MimeBundle(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    pub fn insert(&mut self, mime_type: impl Into<String>, payload: Value) {
        self.0.insert(mime_type.into(), payload);
    }

    pub fn get(&self, mime_type: &str) -> Option<&Value> {
        self.0.get(mime_type)
    }

    pub fn contains(&self, mime_type: &str) -> bool {
        self.0.contains_key(mime_type)
    }

    pub fn mime_types(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Text payload for a MIME type, joining line arrays.
    pub fn text(&self, mime_type: &str) -> Option<String> {
        self.0
            .get(mime_type)
            .and_then(MultilineString::from_value)
            .map(|t| t.text())
    }

    /// The `text/plain` fallback, available independently of the primary.
    pub fn plain(&self) -> Option<String> {
        self.text(MIME_PLAIN)
    }

    /// Pick the single representation to show, by fixed preference.
    ///
    /// An entry that cannot be read as its type (a PNG that is not valid
    /// base64, say) is skipped in favour of the next preference.
    pub fn primary(&self) -> Option<MimeRepresentation> {
        MIME_PREFERENCE
            .iter()
            .find_map(|mime| self.representation(mime))
    }

    fn representation(&self, mime_type: &str) -> Option<MimeRepresentation> {
        let payload = self.0.get(mime_type)?;
        match mime_type {
            MIME_JSON => Some(MimeRepresentation::Json(payload.clone())),
            MIME_MARKDOWN => self.text(mime_type).map(MimeRepresentation::Markdown),
            MIME_HTML => self.text(mime_type).map(MimeRepresentation::Html),
            MIME_SVG => self.text(mime_type).map(MimeRepresentation::Svg),
            MIME_PLAIN => self.text(mime_type).map(MimeRepresentation::Plain),
            MIME_PNG => {
                let encoded = self.text(mime_type)?;
                match decode_base64(&encoded) {
                    Ok(bytes) => Some(MimeRepresentation::Png(bytes)),
                    Err(e) => {
                        warn!("[document] Skipping undecodable image/png payload: {}", e);
                        None
                    }
                }
            }
            _ => None,
        }
    }

    /// Split text payloads into line arrays the way Jupyter writes them.
    /// Binary (base64) and JSON payloads are left alone.
    pub fn into_line_form(self) -> Self {
        MimeBundle(
            self.0
                .into_iter()
                .map(|(mime, payload)| {
                    let split = is_text_mime(&mime) && payload.is_string();
                    let payload = match (split, MultilineString::from_value(&payload)) {
                        (true, Some(text)) => text.into_lines().to_value(),
                        _ => payload,
                    };
                    (mime, payload)
                })
                .collect(),
        )
    }
}

fn is_text_mime(mime: &str) -> bool {
    mime.starts_with("text/") || mime == MIME_SVG
}

/// Decode base64 image data, tolerating the line breaks some kernels insert.
pub fn decode_base64(encoded: &str) -> Result<Bytes, base64::DecodeError> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    BASE64_STANDARD.decode(compact).map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bundle(value: Value) -> MimeBundle {
        MimeBundle::from_map(value.as_object().unwrap())
    }

    #[test]
    fn test_primary_prefers_json_over_everything() {
        let b = bundle(json!({
            "text/plain": "{'a': 1}",
            "text/html": "<b>a</b>",
            "application/json": {"a": 1}
        }));
        assert_eq!(b.primary(), Some(MimeRepresentation::Json(json!({"a": 1}))));
        assert_eq!(b.plain().as_deref(), Some("{'a': 1}"));
    }

    #[test]
    fn test_primary_markdown_beats_html() {
        let b = bundle(json!({"text/html": "<h1>x</h1>", "text/markdown": ["# x\n"]}));
        assert_eq!(b.primary(), Some(MimeRepresentation::Markdown("# x\n".into())));
    }

    #[test]
    fn test_primary_falls_back_to_plain() {
        let b = bundle(json!({"text/plain": ["2"], "application/x-unknown": "zzz"}));
        assert_eq!(b.primary(), Some(MimeRepresentation::Plain("2".into())));
    }

    #[test]
    fn test_png_decodes_with_line_breaks() {
        // "hello" split across two lines
        let b = bundle(json!({"image/png": "aGVs\nbG8=\n", "text/plain": "<Figure>"}));
        match b.primary() {
            Some(MimeRepresentation::Png(bytes)) => assert_eq!(&bytes[..], b"hello"),
            other => panic!("expected png, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_png_skips_to_next_preference() {
        let b = bundle(json!({"image/png": "!!not base64!!", "image/svg+xml": "<svg/>"}));
        assert_eq!(b.primary(), Some(MimeRepresentation::Svg("<svg/>".into())));
    }

    #[test]
    fn test_unknown_mime_only_has_no_primary_but_survives() {
        let b = bundle(json!({"application/vnd.custom+json": {"k": [1, 2]}}));
        assert!(b.primary().is_none());
        assert_eq!(b.to_value(), json!({"application/vnd.custom+json": {"k": [1, 2]}}));
    }

    #[test]
    fn test_into_line_form_splits_text_only() {
        let b = bundle(json!({
            "text/plain": "a\nb",
            "image/png": "aGVsbG8=\n",
            "application/json": {"x": "1\n2"}
        }))
        .into_line_form();
        assert_eq!(b.get("text/plain"), Some(&json!(["a\n", "b"])));
        assert_eq!(b.get("image/png"), Some(&json!("aGVsbG8=\n")));
        assert_eq!(b.get("application/json"), Some(&json!({"x": "1\n2"})));
    }
}
