//! Status line: session position, directory and last command

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::core::SessionId;
use crate::events::{Event, EventKind, Hook, Plugin};

/// What the status line shows
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub active: Option<SessionId>,
    /// 1-based position of the active session
    pub position: usize,
    pub session_count: usize,
    pub cwd: Option<PathBuf>,
    pub last_command: Option<String>,
    pub exited: bool,
}

#[derive(Debug, Default)]
struct StatusState {
    active: Option<SessionId>,
    sessions: BTreeSet<SessionId>,
    cwd: HashMap<SessionId, PathBuf>,
    last_command: HashMap<SessionId, String>,
    exited: BTreeSet<SessionId>,
}

impl StatusState {
    fn apply(&mut self, event: &Event) {
        match event {
            Event::TerminalCreated {
                session_id,
                working_directory,
                ..
            } => {
                self.sessions.insert(*session_id);
                self.cwd.insert(*session_id, working_directory.clone());
                self.active = Some(*session_id);
            }
            Event::TerminalClosed { session_id, .. } => {
                self.sessions.remove(session_id);
                self.cwd.remove(session_id);
                self.last_command.remove(session_id);
                self.exited.remove(session_id);
                if self.active == Some(*session_id) {
                    self.active = None;
                }
            }
            Event::SessionSwitched { to, .. } => self.active = Some(*to),
            Event::CommandExecuted {
                session_id,
                command,
            } => {
                self.last_command.insert(*session_id, command.clone());
            }
            Event::DirectoryChanged { session_id, path } => {
                self.cwd.insert(*session_id, path.clone());
            }
            Event::ProcessExited { session_id, .. } => {
                self.exited.insert(*session_id);
            }
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        let Some(active) = self.active else {
            return StatusSnapshot {
                session_count: self.sessions.len(),
                ..StatusSnapshot::default()
            };
        };
        StatusSnapshot {
            active: Some(active),
            position: self.sessions.range(..=active).count(),
            session_count: self.sessions.len(),
            cwd: self.cwd.get(&active).cloned(),
            last_command: self.last_command.get(&active).cloned(),
            exited: self.exited.contains(&active),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct StatusPlugin {
    state: Rc<RefCell<StatusState>>,
}

impl StatusPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.state.borrow().snapshot()
    }

    /// One-line status no wider than `width` columns
    pub fn render(&self, width: usize) -> String {
        let snapshot = self.snapshot();
        let Some(active) = snapshot.active else {
            return truncate("no session", width);
        };

        let mut line = format!("[{}/{}] #{}", snapshot.position, snapshot.session_count, active);
        if let Some(cwd) = &snapshot.cwd {
            line.push(' ');
            line.push_str(&display_path(cwd));
        }
        if snapshot.exited {
            line.push_str(" (exited)");
        }
        if let Some(command) = &snapshot.last_command {
            line.push_str(" | $ ");
            line.push_str(command);
        }
        truncate(&line, width)
    }
}

impl Plugin for StatusPlugin {
    fn hooks(&self) -> Vec<Hook> {
        EventKind::ALL
            .into_iter()
            .map(|kind| {
                let state = Rc::clone(&self.state);
                Hook::new(kind, move |event| {
                    state.borrow_mut().apply(event);
                    Ok(())
                })
                // Run before other plugins so they see an up to date status
                .with_priority(10)
            })
            .collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Abbreviate the home directory to `~`
fn display_path(path: &Path) -> String {
    if let Some(home) = dirs::home_dir().filter(|h| h.parent().is_some()) {
        if let Ok(rest) = path.strip_prefix(&home) {
            return if rest.as_os_str().is_empty() {
                "~".to_string()
            } else {
                format!("~/{}", rest.display())
            };
        }
    }
    path.display().to_string()
}

/// Cut `text` to `width` display columns, marking the cut with `…`
fn truncate(text: &str, width: usize) -> String {
    if text.width() <= width {
        return text.to_string();
    }
    if width == 0 {
        return String::new();
    }

    let mut out = String::new();
    let mut used = 0;
    for c in text.chars() {
        let w = c.width().unwrap_or(0);
        if used + w > width - 1 {
            break;
        }
        out.push(c);
        used += w;
    }
    out.push('…');
    out
}
