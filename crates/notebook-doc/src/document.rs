//! The notebook document: ordered cells plus opaque metadata.
//!
//! Serialization follows the canonical Jupyter on-disk layout (sorted keys,
//! one-space indent, unescaped non-ASCII, trailing newline) so an unmodified
//! document writes back the bytes it was read from.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::cell::{Cell, CellKind};
use crate::error::DocError;
use crate::mime::MimeBundle;
use crate::output::Output;

const KNOWN_KEYS: [&str; 4] = ["cells", "metadata", "nbformat", "nbformat_minor"];

/// Structural change notifications for views observing a document.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentChange {
    OutputsReset { cell_id: String },
    OutputAppended { cell_id: String, index: usize },
    OutputUpdated { cell_id: String, index: usize },
    ExecutionCountChanged { cell_id: String, execution_count: Option<i64> },
    SourceChanged { cell_id: String },
    CellsChanged,
}

#[derive(Debug)]
pub struct Document {
    cells: Vec<Cell>,
    /// Top-level metadata, preserved verbatim.
    pub metadata: Map<String, Value>,
    nbformat: i64,
    nbformat_minor: i64,
    extra: Map<String, Value>,
    path: Option<PathBuf>,
    dirty: bool,
    missed_display_updates: u64,
    changes: broadcast::Sender<DocumentChange>,
}

impl Document {
    fn with_parts(
        cells: Vec<Cell>,
        metadata: Map<String, Value>,
        nbformat: i64,
        nbformat_minor: i64,
        extra: Map<String, Value>,
    ) -> Self {
        let (changes, _) = broadcast::channel(256);
        Document {
            cells,
            metadata,
            nbformat,
            nbformat_minor,
            extra,
            path: None,
            dirty: false,
            missed_display_updates: 0,
            changes,
        }
    }

    /// A draft document holding one empty code cell.
    pub fn new_empty() -> Self {
        Self::with_parts(vec![Cell::new(CellKind::Code)], Map::new(), 4, 5, Map::new())
    }

    pub fn from_serialized_form(bytes: &[u8]) -> Result<Self, DocError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let obj = value
            .as_object()
            .ok_or_else(|| DocError::MalformedDocument("top level is not an object".into()))?;

        let nbformat = obj
            .get("nbformat")
            .and_then(Value::as_i64)
            .ok_or_else(|| DocError::MalformedDocument("missing `nbformat`".into()))?;
        if nbformat != 4 {
            return Err(DocError::UnsupportedFormat { nbformat });
        }
        let nbformat_minor = obj
            .get("nbformat_minor")
            .and_then(Value::as_i64)
            .ok_or_else(|| DocError::MalformedDocument("missing `nbformat_minor`".into()))?;

        let cells = obj
            .get("cells")
            .and_then(Value::as_array)
            .ok_or_else(|| DocError::MalformedDocument("missing `cells`".into()))?
            .iter()
            .map(Cell::from_record)
            .collect::<Result<Vec<_>, _>>()?;

        let extra = obj
            .iter()
            .filter(|(k, _)| !KNOWN_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self::with_parts(
            cells,
            obj.get("metadata")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            nbformat,
            nbformat_minor,
            extra,
        ))
    }

    pub fn to_serialized_form(&self) -> Result<Vec<u8>, DocError> {
        let mut obj = self.extra.clone();
        obj.insert(
            "cells".into(),
            Value::Array(self.cells.iter().map(Cell::to_record).collect()),
        );
        obj.insert("metadata".into(), Value::Object(self.metadata.clone()));
        obj.insert("nbformat".into(), Value::from(self.nbformat));
        obj.insert("nbformat_minor".into(), Value::from(self.nbformat_minor));

        let canonical = sort_keys(Value::Object(obj));
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        canonical.serialize(&mut ser)?;
        buf.push(b'\n');
        Ok(buf)
    }

    pub fn load(path: &Path) -> Result<Self, DocError> {
        let bytes = std::fs::read(path)?;
        let mut doc = Self::from_serialized_form(&bytes)?;
        doc.path = Some(path.to_path_buf());
        info!("[document] Loaded {} ({} cells)", path.display(), doc.cells.len());
        Ok(doc)
    }

    /// Write to the document's path. Drafts have none and must use `save_as`.
    pub fn save(&mut self) -> Result<(), DocError> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| DocError::MalformedDocument("draft document has no path".into()))?;
        self.save_as(&path)
    }

    pub fn save_as(&mut self, path: &Path) -> Result<(), DocError> {
        let bytes = self.to_serialized_form()?;
        let tmp = path.with_extension("ipynb.tmp");
        if let Err(e) = std::fs::write(&tmp, &bytes).and_then(|_| std::fs::rename(&tmp, path)) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        self.path = Some(path.to_path_buf());
        self.dirty = false;
        info!("[document] Saved {}", path.display());
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DocumentChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: DocumentChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_draft(&self) -> bool {
        self.path.is_none()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn nbformat(&self) -> (i64, i64) {
        (self.nbformat, self.nbformat_minor)
    }

    /// How many `update_display_data` messages found no output to update.
    pub fn missed_display_updates(&self) -> u64 {
        self.missed_display_updates
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cell(&self, cell_id: &str) -> Option<&Cell> {
        self.cells.iter().find(|c| c.id == cell_id)
    }

    pub fn find_cell_index(&self, cell_id: &str) -> Option<usize> {
        self.cells.iter().position(|c| c.id == cell_id)
    }

    pub fn code_cell_ids(&self) -> Vec<String> {
        self.cells
            .iter()
            .filter(|c| c.is_code())
            .map(|c| c.id.clone())
            .collect()
    }

    /// The cell following `cell_id`, if any.
    pub fn next_cell_id(&self, cell_id: &str) -> Option<String> {
        let idx = self.find_cell_index(cell_id)?;
        self.cells.get(idx + 1).map(|c| c.id.clone())
    }

    pub fn cell_source(&self, cell_id: &str) -> Option<String> {
        self.cell(cell_id).map(Cell::source_text)
    }

    pub fn update_cell_source(&mut self, cell_id: &str, source: &str) {
        if let Some(idx) = self.find_cell_index(cell_id) {
            self.cells[idx].set_source(source);
            self.dirty = true;
            self.notify(DocumentChange::SourceChanged {
                cell_id: cell_id.to_string(),
            });
        }
    }

    /// Insert a new cell after `after_cell_id`, or at the top when `None`.
    /// An unknown `after_cell_id` appends at the end.
    pub fn add_cell(&mut self, kind: CellKind, after_cell_id: Option<&str>) -> String {
        let cell = Cell::new(kind).with_persisted_id(self.carries_cell_ids());
        let id = cell.id.clone();

        let insert_idx = match after_cell_id {
            Some(after) => self.find_cell_index(after).map(|i| i + 1),
            None => Some(0),
        };
        match insert_idx {
            Some(idx) => self.cells.insert(idx, cell),
            None => self.cells.push(cell),
        }
        self.dirty = true;
        self.notify(DocumentChange::CellsChanged);
        id
    }

    /// Remove a cell. The last remaining cell is never removed.
    pub fn delete_cell(&mut self, cell_id: &str) -> bool {
        if self.cells.len() <= 1 {
            return false;
        }
        match self.find_cell_index(cell_id) {
            Some(idx) => {
                self.cells.remove(idx);
                self.dirty = true;
                self.notify(DocumentChange::CellsChanged);
                true
            }
            None => false,
        }
    }

    pub fn move_cell(&mut self, cell_id: &str, to_index: usize) -> bool {
        let Some(from) = self.find_cell_index(cell_id) else {
            return false;
        };
        let cell = self.cells.remove(from);
        let to = to_index.min(self.cells.len());
        self.cells.insert(to, cell);
        if from != to {
            self.dirty = true;
            self.notify(DocumentChange::CellsChanged);
        }
        true
    }

    /// User-facing "clear outputs": outputs dropped, count back to unset.
    pub fn clear_cell_outputs(&mut self, cell_id: &str) {
        if let Some(idx) = self.find_cell_index(cell_id) {
            let cell = &mut self.cells[idx];
            if cell.is_code() && (!cell.outputs.is_empty() || cell.execution_count.is_some()) {
                cell.outputs.clear();
                cell.execution_count = None;
                self.dirty = true;
                self.notify(DocumentChange::OutputsReset {
                    cell_id: cell_id.to_string(),
                });
            }
        }
    }

    /// Kernel `clear_output`: outputs dropped, execution count kept.
    pub fn clear_cell_output_list(&mut self, cell_id: &str) {
        if let Some(idx) = self.find_cell_index(cell_id) {
            let cell = &mut self.cells[idx];
            if !cell.outputs.is_empty() {
                cell.outputs.clear();
                self.dirty = true;
                self.notify(DocumentChange::OutputsReset {
                    cell_id: cell_id.to_string(),
                });
            }
        }
    }

    /// Execution-time reset: see [`Cell::reset_outputs`].
    pub fn reset_cell_outputs(&mut self, cell_id: &str) {
        if let Some(idx) = self.find_cell_index(cell_id) {
            self.cells[idx].reset_outputs();
            self.dirty = true;
            self.notify(DocumentChange::OutputsReset {
                cell_id: cell_id.to_string(),
            });
        }
    }

    pub fn set_cell_execution_count(&mut self, cell_id: &str, count: i64) {
        if let Some(idx) = self.find_cell_index(cell_id) {
            let cell = &mut self.cells[idx];
            if cell.is_code() {
                cell.execution_count = Some(count);
                self.dirty = true;
                self.notify(DocumentChange::ExecutionCountChanged {
                    cell_id: cell_id.to_string(),
                    execution_count: Some(count),
                });
            }
        }
    }

    pub fn append_cell_output(&mut self, cell_id: &str, output: Output) {
        let Some(idx) = self.find_cell_index(cell_id) else {
            debug!("[document] Dropping output for missing cell {}", cell_id);
            return;
        };
        let cell = &mut self.cells[idx];
        if cell.add_output(output) {
            let index = cell.outputs.len() - 1;
            self.dirty = true;
            self.notify(DocumentChange::OutputAppended {
                cell_id: cell_id.to_string(),
                index,
            });
        }
    }

    /// Append stream text, extending the cell's last output when it is a
    /// stream of the same name.
    pub fn append_cell_stream(&mut self, cell_id: &str, stream_name: &str, text: &str) {
        let Some(idx) = self.find_cell_index(cell_id) else {
            debug!("[document] Dropping stream for missing cell {}", cell_id);
            return;
        };
        let cell = &mut self.cells[idx];
        if !cell.is_code() {
            return;
        }
        let merged = cell
            .outputs
            .last_mut()
            .is_some_and(|last| last.append_stream_text(stream_name, text));
        if !merged {
            cell.outputs.push(Output::stream(stream_name, text));
        }
        let index = cell.outputs.len() - 1;
        self.dirty = true;
        let change = if merged {
            DocumentChange::OutputUpdated {
                cell_id: cell_id.to_string(),
                index,
            }
        } else {
            DocumentChange::OutputAppended {
                cell_id: cell_id.to_string(),
                index,
            }
        };
        self.notify(change);
    }

    /// Update the first display output, across all cells in order, that
    /// carries `display_id`. A miss is logged and counted.
    pub fn update_output_by_display_id(
        &mut self,
        display_id: &str,
        data: &MimeBundle,
        metadata: &Map<String, Value>,
    ) -> bool {
        let found = self.cells.iter().enumerate().find_map(|(cell_idx, cell)| {
            cell.outputs
                .iter()
                .position(|o| o.display_id() == Some(display_id))
                .map(|index| (cell_idx, index))
        });
        if let Some((cell_idx, index)) = found {
            let cell = &mut self.cells[cell_idx];
            cell.update_output_by_display_id(display_id, data, metadata);
            let cell_id = cell.id.clone();
            self.dirty = true;
            self.notify(DocumentChange::OutputUpdated { cell_id, index });
            return true;
        }
        self.missed_display_updates += 1;
        warn!(
            "[document] No output with display_id {} to update ({} misses)",
            display_id, self.missed_display_updates
        );
        false
    }

    /// nbformat 4.5 introduced cell ids.
    fn carries_cell_ids(&self) -> bool {
        self.nbformat > 4 || (self.nbformat == 4 && self.nbformat_minor >= 5)
    }
}

/// Rebuild objects with keys in sorted order, independent of how the JSON
/// map type orders its entries.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}
