use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::memory::types::MemoryMode;

/// Process-wide memory state: the current mode and at most one accumulated summary.
///
/// This is a plain value. `SessionManager` owns the only instance and guards it
/// with a lock, so every read-then-write of the summary happens under that lock.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStore {
    mode: MemoryMode,
    accumulated_summary: Option<String>,
    /// Number of session summaries folded into `accumulated_summary`.
    summaries_folded: u64,
    updated_at: Option<DateTime<Utc>>,
}

impl MemoryStore {
    pub fn new(mode: MemoryMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn get_mode(&self) -> MemoryMode {
        self.mode
    }

    /// Switching the mode never touches a stored summary; it only becomes inert while off.
    pub fn set_mode(&mut self, mode: MemoryMode) {
        self.mode = mode;
    }

    pub fn get_summary(&self) -> Option<&str> {
        self.accumulated_summary.as_deref()
    }

    /// Store `summary` as the new accumulated summary. Blank text clears it.
    pub fn set_summary(&mut self, summary: impl Into<String>) {
        let summary = summary.into();
        if summary.trim().is_empty() {
            self.clear();
            return;
        }

        self.accumulated_summary = Some(summary);
        self.summaries_folded += 1;
        self.updated_at = Some(Utc::now());
    }

    pub fn clear(&mut self) {
        self.accumulated_summary = None;
        self.summaries_folded = 0;
        self.updated_at = Some(Utc::now());
    }

    /// The summary a new session should be seeded with, if any.
    pub fn seed(&self) -> Option<String> {
        match self.mode {
            MemoryMode::On => self.accumulated_summary.clone(),
            MemoryMode::Off => None,
        }
    }

    pub fn summaries_folded(&self) -> u64 {
        self.summaries_folded
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}
