//! Per-document run queue: FIFO pending cells plus at most one executing.

use std::collections::VecDeque;

use log::debug;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CellQueueStatus {
    Pending,
    Executing,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueuedCell {
    pub cell_id: String,
    pub status: CellQueueStatus,
    /// 0 is the executing cell, or the next to run when nothing is.
    pub position: usize,
}

/// Snapshot published on every queue transition.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExecutionQueueState {
    pub processing: bool,
    pub cells: Vec<QueuedCell>,
    pub executing_cell_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct ExecutionQueue {
    pending: VecDeque<String>,
    executing: Option<String>,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a cell to the back of the queue. A cell that is already pending or
    /// executing is left where it is; returns whether it was added.
    pub fn enqueue(&mut self, cell_id: impl Into<String>) -> bool {
        let cell_id = cell_id.into();
        if self.contains(&cell_id) {
            debug!("[queue] {} already queued", cell_id);
            return false;
        }
        self.pending.push_back(cell_id);
        true
    }

    /// Next cell to run. `None` while a cell is executing.
    pub fn dequeue(&mut self) -> Option<String> {
        if self.executing.is_some() {
            return None;
        }
        let cell_id = self.pending.pop_front()?;
        self.executing = Some(cell_id.clone());
        Some(cell_id)
    }

    /// Mark `cell_id` finished. Ignored unless it is the executing cell.
    pub fn complete(&mut self, cell_id: &str) -> bool {
        if self.is_executing(cell_id) {
            self.executing = None;
            true
        } else {
            false
        }
    }

    /// Drop every pending cell; the executing one is untouched.
    pub fn clear_pending(&mut self) -> Vec<String> {
        self.pending.drain(..).collect()
    }

    pub fn contains(&self, cell_id: &str) -> bool {
        self.is_executing(cell_id) || self.pending.iter().any(|id| id == cell_id)
    }

    pub fn is_executing(&self, cell_id: &str) -> bool {
        self.executing.as_deref() == Some(cell_id)
    }

    pub fn executing(&self) -> Option<&str> {
        self.executing.as_deref()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.executing.is_none()
    }

    pub fn get_state(&self) -> ExecutionQueueState {
        let executing = self
            .executing
            .iter()
            .map(|id| (id, CellQueueStatus::Executing));
        let pending = self.pending.iter().map(|id| (id, CellQueueStatus::Pending));
        let cells = executing
            .chain(pending)
            .enumerate()
            .map(|(position, (cell_id, status))| QueuedCell {
                cell_id: cell_id.clone(),
                status,
                position,
            })
            .collect();

        ExecutionQueueState {
            processing: !self.is_empty(),
            cells,
            executing_cell_id: self.executing.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_of(ids: &[&str]) -> ExecutionQueue {
        let mut queue = ExecutionQueue::new();
        for id in ids {
            queue.enqueue(*id);
        }
        queue
    }

    #[test]
    fn test_new_queue_is_empty() {
        let mut queue = ExecutionQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn test_dequeue_is_fifo() {
        let mut queue = queue_of(&["cell-1", "cell-2", "cell-3"]);

        assert_eq!(queue.dequeue(), Some("cell-1".to_string()));
        assert!(queue.complete("cell-1"));
        assert_eq!(queue.dequeue(), Some("cell-2".to_string()));
        assert!(queue.complete("cell-2"));
        assert_eq!(queue.dequeue(), Some("cell-3".to_string()));
    }

    #[test]
    fn test_dequeue_blocked_while_executing() {
        let mut queue = queue_of(&["cell-1", "cell-2"]);
        queue.dequeue();

        assert_eq!(queue.dequeue(), None);
        assert_eq!(queue.executing(), Some("cell-1"));
        assert_eq!(queue.pending_len(), 1);
    }

    #[test]
    fn test_enqueue_skips_queued_and_executing_cells() {
        let mut queue = queue_of(&["cell-1", "cell-2"]);
        assert!(!queue.enqueue("cell-2"));

        queue.dequeue();
        assert!(!queue.enqueue("cell-1"));
        assert_eq!(queue.pending_len(), 1);

        queue.complete("cell-1");
        assert!(queue.enqueue("cell-1"));
    }

    #[test]
    fn test_complete_ignores_other_cells() {
        let mut queue = queue_of(&["cell-1"]);
        queue.dequeue();

        assert!(!queue.complete("cell-2"));
        assert!(queue.is_executing("cell-1"));
    }

    #[test]
    fn test_clear_pending_keeps_executing() {
        let mut queue = queue_of(&["cell-1", "cell-2", "cell-3"]);
        queue.dequeue();

        assert_eq!(queue.clear_pending(), vec!["cell-2", "cell-3"]);
        assert!(!queue.is_empty());
        assert!(queue.is_executing("cell-1"));
    }

    #[test]
    fn test_get_state_orders_executing_first() {
        let mut queue = queue_of(&["cell-1", "cell-2", "cell-3"]);
        queue.dequeue();

        let state = queue.get_state();
        assert!(state.processing);
        assert_eq!(state.executing_cell_id.as_deref(), Some("cell-1"));
        let summary: Vec<_> = state
            .cells
            .iter()
            .map(|c| (c.cell_id.as_str(), c.status, c.position))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("cell-1", CellQueueStatus::Executing, 0),
                ("cell-2", CellQueueStatus::Pending, 1),
                ("cell-3", CellQueueStatus::Pending, 2),
            ]
        );
    }

    #[test]
    fn test_get_state_idle() {
        let state = ExecutionQueue::new().get_state();
        assert!(!state.processing);
        assert!(state.cells.is_empty());
        assert!(state.executing_cell_id.is_none());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let mut queue = queue_of(&["cell-1", "cell-2"]);
        queue.dequeue();

        let json = serde_json::to_value(queue.get_state()).unwrap();
        assert_eq!(json["processing"], true);
        assert_eq!(json["executing_cell_id"], "cell-1");
        assert_eq!(json["cells"][0]["status"], "executing");
        assert_eq!(json["cells"][1]["status"], "pending");
        assert_eq!(json["cells"][1]["position"], 1);
    }
}
