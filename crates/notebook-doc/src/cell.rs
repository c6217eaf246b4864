use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::DocError;
use crate::mime::MimeBundle;
use crate::multiline::MultilineString;
use crate::output::Output;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    Code,
    Markdown,
    Raw,
}

impl CellKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellKind::Code => "code",
            CellKind::Markdown => "markdown",
            CellKind::Raw => "raw",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "code" => Some(CellKind::Code),
            "markdown" => Some(CellKind::Markdown),
            "raw" => Some(CellKind::Raw),
            _ => None,
        }
    }
}

const KNOWN_KEYS: [&str; 7] = [
    "cell_type",
    "id",
    "source",
    "metadata",
    "execution_count",
    "outputs",
    "attachments",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub id: String,
    pub kind: CellKind,
    pub source: MultilineString,
    pub metadata: Map<String, Value>,
    /// Code cells only. Assigned by the kernel.
    pub execution_count: Option<i64>,
    /// Code cells only.
    pub outputs: Vec<Output>,
    attachments: Option<Value>,
    /// Keys this model does not interpret, written back untouched.
    extra: Map<String, Value>,
    /// Whether `id` is written to disk. Generated ids are not, unless the
    /// document format carries them.
    persist_id: bool,
}

impl Cell {
    pub fn new(kind: CellKind) -> Self {
        Cell {
            id: Uuid::new_v4().to_string(),
            kind,
            source: MultilineString::default(),
            metadata: Map::new(),
            execution_count: None,
            outputs: Vec::new(),
            attachments: None,
            extra: Map::new(),
            persist_id: true,
        }
    }

    pub(crate) fn with_persisted_id(mut self, persist_id: bool) -> Self {
        self.persist_id = persist_id;
        self
    }

    /// Read a cell record. Cells without an id get a fresh UUID that is
    /// kept in memory only.
    pub fn from_record(record: &Value) -> Result<Self, DocError> {
        let obj = record
            .as_object()
            .ok_or_else(|| DocError::MalformedDocument("cell is not an object".into()))?;

        let kind = obj
            .get("cell_type")
            .and_then(Value::as_str)
            .and_then(CellKind::parse)
            .ok_or_else(|| DocError::MalformedDocument("cell has no valid `cell_type`".into()))?;

        let (id, persist_id) = match obj.get("id").and_then(Value::as_str) {
            Some(id) => (id.to_string(), true),
            None => (Uuid::new_v4().to_string(), false),
        };

        let source = match obj.get("source") {
            Some(v) => MultilineString::from_value(v)
                .ok_or_else(|| DocError::MalformedDocument(format!("cell {} has invalid source", id)))?,
            None => MultilineString::default(),
        };

        let outputs = match obj.get("outputs").and_then(Value::as_array) {
            Some(records) => records
                .iter()
                .map(Output::from_persisted)
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let extra = obj
            .iter()
            .filter(|(k, _)| !KNOWN_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Cell {
            id,
            kind,
            source,
            metadata: obj
                .get("metadata")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            execution_count: obj.get("execution_count").and_then(Value::as_i64),
            outputs,
            attachments: obj.get("attachments").cloned(),
            extra,
            persist_id,
        })
    }

    pub fn to_record(&self) -> Value {
        let mut obj = self.extra.clone();
        obj.insert("cell_type".into(), Value::String(self.kind.as_str().into()));
        if self.persist_id {
            obj.insert("id".into(), Value::String(self.id.clone()));
        }
        obj.insert("metadata".into(), Value::Object(self.metadata.clone()));
        obj.insert("source".into(), self.source.to_value());
        if let Some(attachments) = &self.attachments {
            obj.insert("attachments".into(), attachments.clone());
        }
        if self.kind == CellKind::Code {
            obj.insert(
                "execution_count".into(),
                self.execution_count.map(Value::from).unwrap_or(Value::Null),
            );
            obj.insert(
                "outputs".into(),
                Value::Array(self.outputs.iter().map(Output::to_persisted).collect()),
            );
        }
        Value::Object(obj)
    }

    pub fn is_code(&self) -> bool {
        self.kind == CellKind::Code
    }

    pub fn source_text(&self) -> String {
        self.source.text()
    }

    pub fn set_source(&mut self, source: &str) {
        self.source = MultilineString::from_text(source);
    }

    /// Drop every output and reset the execution count to 0.
    pub fn reset_outputs(&mut self) {
        self.outputs.clear();
        if self.is_code() {
            self.execution_count = Some(0);
        }
    }

    /// Append an output. Non-code cells have no outputs and ignore it.
    pub fn add_output(&mut self, output: Output) -> bool {
        if !self.is_code() {
            return false;
        }
        self.outputs.push(output);
        true
    }

    /// Replace the payload of the first display output carrying `display_id`.
    ///
    /// Returns false when no output matches; the caller decides whether that
    /// is worth reporting.
    pub fn update_output_by_display_id(
        &mut self,
        display_id: &str,
        data: &MimeBundle,
        metadata: &Map<String, Value>,
    ) -> bool {
        for output in self.outputs.iter_mut() {
            if let Output::DisplayData {
                data: d,
                metadata: m,
                display_id: Some(id),
                ..
            } = output
            {
                if id == display_id {
                    *d = data.clone();
                    *m = Some(metadata.clone());
                    return true;
                }
            }
        }
        false
    }
}
