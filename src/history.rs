use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_MAX_HISTORY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("nothing to undo")]
    NothingToUndo,
    #[error("nothing to redo")]
    NothingToRedo,
}

/// Snapshot of the whole chart after one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub title: String,
    pub source: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Linear undo stack with a cursor. Entry 0 is the oldest reachable snapshot.
#[derive(Debug, Clone)]
pub struct History {
    entries: Vec<HistoryEntry>,
    cursor: usize,
    max_size: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}

impl History {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            cursor: 0,
            max_size: max_size.max(1),
        }
    }

    /// Appends a snapshot, discarding anything after the cursor.
    pub fn record(&mut self, title: &str, source: &str, description: impl Into<String>) {
        if !self.entries.is_empty() {
            self.entries.truncate(self.cursor + 1);
        }
        self.entries.push(HistoryEntry {
            title: title.to_string(),
            source: source.to_string(),
            description: description.into(),
            created_at: Utc::now(),
        });
        self.cursor = self.entries.len() - 1;

        if self.entries.len() > self.max_size {
            let overflow = self.entries.len() - self.max_size;
            self.entries.drain(0..overflow);
            self.cursor -= overflow;
        }
    }

    pub fn undo(&mut self) -> Result<&HistoryEntry, HistoryError> {
        if !self.can_undo() {
            return Err(HistoryError::NothingToUndo);
        }
        self.cursor -= 1;
        Ok(&self.entries[self.cursor])
    }

    pub fn redo(&mut self) -> Result<&HistoryEntry, HistoryError> {
        if !self.can_redo() {
            return Err(HistoryError::NothingToRedo);
        }
        self.cursor += 1;
        Ok(&self.entries[self.cursor])
    }

    pub fn can_undo(&self) -> bool {
        self.cursor >= 1
    }

    pub fn can_redo(&self) -> bool {
        self.cursor + 1 < self.entries.len()
    }

    pub fn current(&self) -> Option<&HistoryEntry> {
        self.entries.get(self.cursor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorded(n: usize, max: usize) -> History {
        let mut history = History::new(max);
        for i in 0..n {
            history.record("t", &format!("graph TD\n    N{i}\n"), format!("step {i}"));
        }
        history
    }

    #[test]
    fn undo_at_first_snapshot_is_recoverable() {
        let mut history = recorded(1, 5);
        assert_eq!(history.undo().unwrap_err(), HistoryError::NothingToUndo);
        assert_eq!(history.current().unwrap().description, "step 0");
    }

    #[test]
    fn undo_then_redo_walks_the_cursor() {
        let mut history = recorded(3, 5);
        assert_eq!(history.undo().unwrap().description, "step 1");
        assert_eq!(history.undo().unwrap().description, "step 0");
        assert_eq!(history.redo().unwrap().description, "step 1");
        assert!(history.can_redo());
    }

    #[test]
    fn record_after_undo_drops_redo_branch() {
        let mut history = recorded(3, 5);
        history.undo().unwrap();
        history.record("t", "graph TD\n", "branch");
        assert_eq!(history.len(), 3);
        assert_eq!(history.redo().unwrap_err(), HistoryError::NothingToRedo);
        assert_eq!(history.current().unwrap().description, "branch");
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut history = recorded(DEFAULT_MAX_HISTORY + 1, DEFAULT_MAX_HISTORY);
        assert_eq!(history.len(), DEFAULT_MAX_HISTORY);
        assert_eq!(history.cursor(), DEFAULT_MAX_HISTORY - 1);

        let mut oldest = String::new();
        while let Ok(entry) = history.undo() {
            oldest = entry.description.clone();
        }
        assert_eq!(oldest, "step 1");
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let history = recorded(3, 0);
        assert_eq!(history.len(), 1);
        assert_eq!(history.max_size(), 1);
    }
}
