//! Command history for a session
//!
//! Bounded recall buffer with up/down navigation and prefix suggestions.

use std::collections::{HashSet, VecDeque};

/// Maximum number of history entries per session
pub const HISTORY_LIMIT: usize = 100;

/// Maximum number of suggestions returned
pub const SUGGESTION_LIMIT: usize = 10;

/// Navigation direction through history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards the oldest entry (Up)
    Older,
    /// Back towards the line being typed (Down)
    Newer,
}

/// Per-session command history
#[derive(Debug, Clone)]
pub struct CommandHistoryStore {
    /// All entries (newest last)
    entries: VecDeque<String>,
    /// Maximum entries
    limit: usize,
    /// Index into `entries` while navigating
    cursor: Option<usize>,
    /// Line being typed when navigation started
    stash: String,
    /// Skip commands that look like they carry credentials
    ignore_sensitive: bool,
    suggestion_limit: usize,
}

impl Default for CommandHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandHistoryStore {
    pub fn new() -> Self {
        Self::with_limit(HISTORY_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
            cursor: None,
            stash: String::new(),
            ignore_sensitive: false,
            suggestion_limit: SUGGESTION_LIMIT,
        }
    }

    pub fn ignore_sensitive(mut self, ignore: bool) -> Self {
        self.ignore_sensitive = ignore;
        self
    }

    pub fn suggestion_limit(mut self, limit: usize) -> Self {
        self.suggestion_limit = limit;
        self
    }

    /// Add a command. Returns `true` if an entry was recorded.
    pub fn append(&mut self, command: &str) -> bool {
        // Skip empty or whitespace-only commands
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return false;
        }

        // Skip if same as last command (dedup consecutive)
        if self.entries.back().is_some_and(|last| last == trimmed) {
            return false;
        }

        if self.ignore_sensitive && is_sensitive(trimmed) {
            return false;
        }

        self.entries.push_back(trimmed.to_string());
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
        true
    }

    /// Step through history
    ///
    /// `current` is the line being typed; it is remembered on the first step
    /// and handed back when navigating newer past the latest entry. Returns
    /// `None` when there is nowhere further to go.
    pub fn navigate(&mut self, direction: Direction, current: &str) -> Option<String> {
        match (direction, self.cursor) {
            (Direction::Older, None) => {
                let newest = self.entries.len().checked_sub(1)?;
                self.stash = current.to_string();
                self.cursor = Some(newest);
                Some(self.entries[newest].clone())
            }
            (Direction::Older, Some(0)) => None,
            (Direction::Older, Some(i)) => {
                self.cursor = Some(i - 1);
                Some(self.entries[i - 1].clone())
            }
            (Direction::Newer, None) => None,
            (Direction::Newer, Some(i)) if i + 1 < self.entries.len() => {
                self.cursor = Some(i + 1);
                Some(self.entries[i + 1].clone())
            }
            (Direction::Newer, Some(_)) => {
                self.cursor = None;
                Some(std::mem::take(&mut self.stash))
            }
        }
    }

    /// Leave navigation mode
    pub fn reset_navigation(&mut self) {
        self.cursor = None;
        self.stash.clear();
    }

    pub fn is_navigating(&self) -> bool {
        self.cursor.is_some()
    }

    /// Entries starting with `prefix` (case-insensitive), newest first
    pub fn suggest(&self, prefix: &str) -> Vec<String> {
        let prefix = prefix.to_lowercase();
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .rev()
            .filter(|e| e.to_lowercase().starts_with(&prefix))
            .filter(|e| seen.insert(e.as_str()))
            .take(self.suggestion_limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries oldest first
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }
}

/// Check if command is sensitive (shouldn't be saved)
fn is_sensitive(command: &str) -> bool {
    let lower = command.to_lowercase();
    let sensitive_patterns = [
        "password", "passwd", "secret", "token", "api_key", "apikey",
        "credential", "ssh-add", "gpg",
    ];
    sensitive_patterns.iter().any(|p| lower.contains(p))
}
