//! Typed kernel outputs and their nbformat records.

use std::fmt;
use std::str::FromStr;

use serde_json::{json, Map, Value};

use crate::error::DocError;
use crate::mime::MimeBundle;
use crate::multiline::MultilineString;

/// The `output_type` discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputType {
    Stream,
    DisplayData,
    ExecuteResult,
    Error,
}

impl OutputType {
    /// Keys an on-disk record of this type is modelled by. Anything else is
    /// carried through untouched.
    fn record_keys(&self) -> &'static [&'static str] {
        match self {
            OutputType::Stream => &["output_type", "name", "text"],
            OutputType::DisplayData => &["output_type", "data", "metadata"],
            OutputType::ExecuteResult => &["output_type", "data", "metadata", "execution_count"],
            OutputType::Error => &["output_type", "ename", "evalue", "traceback"],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputType::Stream => "stream",
            OutputType::DisplayData => "display_data",
            OutputType::ExecuteResult => "execute_result",
            OutputType::Error => "error",
        }
    }
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputType {
    type Err = DocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(OutputType::Stream),
            "display_data" => Ok(OutputType::DisplayData),
            "execute_result" => Ok(OutputType::ExecuteResult),
            "error" => Ok(OutputType::Error),
            other => Err(DocError::malformed(other, "unknown output_type")),
        }
    }
}

/// One unit of kernel output.
///
/// `extra` holds record keys this model does not know, so a loaded output is
/// written back as it was read. `metadata` is `None` only for a record that
/// had no `metadata` key.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Stream {
        name: String,
        text: MultilineString,
        extra: Map<String, Value>,
    },
    DisplayData {
        data: MimeBundle,
        metadata: Option<Map<String, Value>>,
        /// Correlator for `update_display_data`. Lives in the message's
        /// `transient` block and is never written to disk.
        display_id: Option<String>,
        extra: Map<String, Value>,
    },
    ExecuteResult {
        data: MimeBundle,
        metadata: Option<Map<String, Value>>,
        execution_count: Option<i64>,
        extra: Map<String, Value>,
    },
    Error {
        name: String,
        value: String,
        traceback: Vec<String>,
        extra: Map<String, Value>,
    },
}

impl Output {
    pub fn stream(name: &str, text: &str) -> Self {
        Output::Stream {
            name: name.to_string(),
            text: MultilineString::from_text(text),
            extra: Map::new(),
        }
    }

    pub fn error(name: &str, value: &str, traceback: Vec<String>) -> Self {
        Output::Error {
            name: name.to_string(),
            value: value.to_string(),
            traceback,
            extra: Map::new(),
        }
    }

    /// Build an output from kernel message content (or a persisted record,
    /// which carries the same keys) for the given output type.
    pub fn parse(content: &Value, output_type: OutputType) -> Result<Self, DocError> {
        let obj = content
            .as_object()
            .ok_or_else(|| DocError::malformed(output_type.as_str(), "content is not an object"))?;

        match output_type {
            OutputType::Stream => Ok(Output::Stream {
                name: required_str(obj, output_type, "name")?,
                text: obj
                    .get("text")
                    .and_then(MultilineString::from_value)
                    .ok_or_else(|| DocError::malformed("stream", "missing or invalid `text`"))?,
                extra: Map::new(),
            }),
            OutputType::DisplayData => Ok(Output::DisplayData {
                data: required_bundle(obj, output_type)?,
                metadata: Some(optional_metadata(obj)),
                display_id: obj
                    .get("transient")
                    .and_then(|t| t.get("display_id"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                extra: Map::new(),
            }),
            OutputType::ExecuteResult => {
                let execution_count = match obj.get("execution_count") {
                    Some(Value::Null) => None,
                    Some(v) => Some(v.as_i64().ok_or_else(|| {
                        DocError::malformed("execute_result", "`execution_count` is not an integer")
                    })?),
                    None => {
                        return Err(DocError::malformed(
                            "execute_result",
                            "missing `execution_count`",
                        ))
                    }
                };
                Ok(Output::ExecuteResult {
                    data: required_bundle(obj, output_type)?,
                    metadata: Some(optional_metadata(obj)),
                    execution_count,
                    extra: Map::new(),
                })
            }
            OutputType::Error => {
                let traceback = obj
                    .get("traceback")
                    .and_then(Value::as_array)
                    .and_then(|lines| {
                        lines
                            .iter()
                            .map(|l| l.as_str().map(str::to_string))
                            .collect::<Option<Vec<_>>>()
                    })
                    .ok_or_else(|| DocError::malformed("error", "missing or invalid `traceback`"))?;
                Ok(Output::Error {
                    name: required_str(obj, output_type, "ename")?,
                    value: required_str(obj, output_type, "evalue")?,
                    traceback,
                    extra: Map::new(),
                })
            }
        }
    }

    /// Read an on-disk output record.
    pub fn from_persisted(record: &Value) -> Result<Self, DocError> {
        let output_type = record
            .get("output_type")
            .and_then(Value::as_str)
            .ok_or_else(|| DocError::malformed("unknown", "missing `output_type`"))?
            .parse::<OutputType>()?;
        let mut output = Output::parse(record, output_type)?;

        let Some(obj) = record.as_object() else {
            return Ok(output);
        };
        let known = output_type.record_keys();
        let unknown: Map<String, Value> = obj
            .iter()
            .filter(|(k, _)| !known.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        match &mut output {
            Output::Stream { extra, .. } | Output::Error { extra, .. } => *extra = unknown,
            Output::DisplayData {
                metadata, extra, ..
            }
            | Output::ExecuteResult {
                metadata, extra, ..
            } => {
                if !obj.contains_key("metadata") {
                    *metadata = None;
                }
                *extra = unknown;
            }
        }
        Ok(output)
    }

    /// The on-disk record for this output; the inverse of `from_persisted`.
    pub fn to_persisted(&self) -> Value {
        let (extra, fields) = match self {
            Output::Stream { name, text, extra } => (
                extra,
                json!({
                    "output_type": "stream",
                    "name": name,
                    "text": text.to_value(),
                }),
            ),
            Output::DisplayData {
                data,
                metadata,
                extra,
                ..
            } => {
                let mut fields = json!({
                    "output_type": "display_data",
                    "data": data.to_value(),
                });
                if let Some(metadata) = metadata {
                    fields["metadata"] = Value::Object(metadata.clone());
                }
                (extra, fields)
            }
            Output::ExecuteResult {
                data,
                metadata,
                execution_count,
                extra,
            } => {
                let mut fields = json!({
                    "output_type": "execute_result",
                    "data": data.to_value(),
                    "execution_count": execution_count,
                });
                if let Some(metadata) = metadata {
                    fields["metadata"] = Value::Object(metadata.clone());
                }
                (extra, fields)
            }
            Output::Error {
                name,
                value,
                traceback,
                extra,
            } => (
                extra,
                json!({
                    "output_type": "error",
                    "ename": name,
                    "evalue": value,
                    "traceback": traceback,
                }),
            ),
        };

        let mut record = extra.clone();
        if let Value::Object(fields) = fields {
            record.extend(fields);
        }
        Value::Object(record)
    }

    pub fn output_type(&self) -> OutputType {
        match self {
            Output::Stream { .. } => OutputType::Stream,
            Output::DisplayData { .. } => OutputType::DisplayData,
            Output::ExecuteResult { .. } => OutputType::ExecuteResult,
            Output::Error { .. } => OutputType::Error,
        }
    }

    pub fn display_id(&self) -> Option<&str> {
        match self {
            Output::DisplayData { display_id, .. } => display_id.as_deref(),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Output::Error { .. })
    }

    pub fn data(&self) -> Option<&MimeBundle> {
        match self {
            Output::DisplayData { data, .. } | Output::ExecuteResult { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Concatenate `text` onto this output if it is a stream named `name`.
    /// Returns false (and leaves the output alone) otherwise.
    pub fn append_stream_text(&mut self, stream_name: &str, more: &str) -> bool {
        match self {
            Output::Stream { name, text, .. } if name == stream_name => {
                let mut joined = text.text();
                joined.push_str(more);
                *text = match text {
                    MultilineString::Single(_) => MultilineString::Single(joined),
                    MultilineString::Lines(_) => MultilineString::from_text(&joined),
                };
                true
            }
            _ => false,
        }
    }

    /// Normalize text fields to the line-array form Jupyter writes.
    pub fn into_line_form(self) -> Self {
        match self {
            Output::Stream { name, text, extra } => Output::Stream {
                name,
                text: text.into_lines(),
                extra,
            },
            Output::DisplayData {
                data,
                metadata,
                display_id,
                extra,
            } => Output::DisplayData {
                data: data.into_line_form(),
                metadata,
                display_id,
                extra,
            },
            Output::ExecuteResult {
                data,
                metadata,
                execution_count,
                extra,
            } => Output::ExecuteResult {
                data: data.into_line_form(),
                metadata,
                execution_count,
                extra,
            },
            error => error,
        }
    }
}

fn required_str(
    obj: &Map<String, Value>,
    output_type: OutputType,
    key: &str,
) -> Result<String, DocError> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DocError::malformed(output_type.as_str(), format!("missing `{}`", key)))
}

fn required_bundle(obj: &Map<String, Value>, output_type: OutputType) -> Result<MimeBundle, DocError> {
    obj.get("data")
        .and_then(Value::as_object)
        .map(MimeBundle::from_map)
        .ok_or_else(|| DocError::malformed(output_type.as_str(), "missing `data`"))
}

fn optional_metadata(obj: &Map<String, Value>) -> Map<String, Value> {
    obj.get("metadata")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// Aggregated view over a cell's outputs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionSummary {
    pub stdout: String,
    pub stderr: String,
    pub result: Option<MimeBundle>,
    pub error: Option<(String, String)>,
}

impl ExecutionSummary {
    pub fn from_outputs<'a>(outputs: impl IntoIterator<Item = &'a Output>) -> Self {
        let mut summary = ExecutionSummary::default();
        for output in outputs {
            match output {
                Output::Stream { name, text, .. } if name == "stdout" => {
                    summary.stdout.push_str(&text.text())
                }
                Output::Stream { name, text, .. } if name == "stderr" => {
                    summary.stderr.push_str(&text.text())
                }
                Output::ExecuteResult { data, .. } => summary.result = Some(data.clone()),
                Output::Error { name, value, .. } => {
                    summary.error = Some((name.clone(), value.clone()))
                }
                _ => {}
            }
        }
        summary
    }

    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}
