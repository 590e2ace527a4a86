//! Git branch tracking per session
//!
//! Finds the repository enclosing a session's directory by walking up to a
//! `.git` directory (or a `.git` file pointing elsewhere, as worktrees and
//! submodules use) and reads `HEAD` directly; no `git` process is spawned.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::core::SessionId;
use crate::events::{Event, EventKind, Hook, Plugin};

/// Minimum time between HEAD checks for one session
const HEAD_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Where HEAD points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitHead {
    Branch(String),
    /// Detached at this abbreviated commit
    Detached(String),
}

impl fmt::Display for GitHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitHead::Branch(name) => f.write_str(name),
            GitHead::Detached(sha) => write!(f, "({sha})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitInfo {
    /// Working tree root
    pub root: PathBuf,
    pub git_dir: PathBuf,
    pub head: GitHead,
    head_mtime: Option<SystemTime>,
}

/// Find the repository containing `start`, if any
pub fn discover(start: &Path) -> Result<Option<GitInfo>> {
    for dir in start.ancestors() {
        let dot_git = dir.join(".git");
        let git_dir = if dot_git.is_dir() {
            dot_git
        } else if dot_git.is_file() {
            read_gitdir_file(&dot_git)?
        } else {
            continue;
        };

        let head_path = git_dir.join("HEAD");
        let head = read_head(&head_path)?;
        return Ok(Some(GitInfo {
            root: dir.to_path_buf(),
            head_mtime: modified(&head_path),
            git_dir,
            head,
        }));
    }
    Ok(None)
}

/// `.git` as a file: `gitdir: <path>`, relative to the file's directory
fn read_gitdir_file(path: &Path) -> Result<PathBuf> {
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let Some(target) = content.trim().strip_prefix("gitdir:") else {
        bail!("{} has no gitdir line", path.display());
    };
    let target = PathBuf::from(target.trim());
    Ok(match path.parent() {
        Some(base) if target.is_relative() => base.join(target),
        _ => target,
    })
}

fn read_head(path: &Path) -> Result<GitHead> {
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let content = content.trim();

    if let Some(reference) = content.strip_prefix("ref:") {
        let reference = reference.trim();
        let name = reference.strip_prefix("refs/heads/").unwrap_or(reference);
        return Ok(GitHead::Branch(name.to_string()));
    }
    if content.len() >= 7 && content.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(GitHead::Detached(content[..7].to_string()));
    }
    bail!("unrecognized HEAD in {}", path.display())
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[derive(Debug)]
struct Tracked {
    dir: PathBuf,
    info: Option<GitInfo>,
    /// Rediscover on next query (a `git` command may have created or moved
    /// the repository)
    stale: bool,
    checked: Instant,
}

#[derive(Debug, Default)]
struct GitState {
    sessions: HashMap<SessionId, Tracked>,
}

impl GitState {
    /// Start tracking `dir`. A directory that can't be read as a repository
    /// still replaces whatever the session was tracking before.
    fn track(&mut self, session_id: SessionId, dir: &Path) -> Result<()> {
        let found = discover(dir);
        let info = match &found {
            Ok(Some(info)) => {
                debug!(
                    session_id,
                    head = %info.head,
                    root = %info.root.display(),
                    "git repository"
                );
                Some(info.clone())
            }
            Ok(None) | Err(_) => None,
        };
        self.sessions.insert(
            session_id,
            Tracked {
                dir: dir.to_path_buf(),
                info,
                stale: false,
                checked: Instant::now(),
            },
        );
        found.map(|_| ())
    }

    fn refresh(&mut self, session_id: SessionId, now: Instant) -> Result<()> {
        let Some(tracked) = self.sessions.get_mut(&session_id) else {
            return Ok(());
        };
        if tracked.stale {
            tracked.stale = false;
            tracked.checked = now;
            return match discover(&tracked.dir) {
                Ok(info) => {
                    tracked.info = info;
                    Ok(())
                }
                Err(e) => {
                    tracked.info = None;
                    Err(e)
                }
            };
        }
        if now.saturating_duration_since(tracked.checked) < HEAD_CHECK_INTERVAL {
            return Ok(());
        }
        tracked.checked = now;
        if let Some(info) = &mut tracked.info {
            let head_path = info.git_dir.join("HEAD");
            let mtime = modified(&head_path);
            if mtime != info.head_mtime {
                info.head = read_head(&head_path)?;
                info.head_mtime = mtime;
            }
        }
        Ok(())
    }
}

/// Tracks the git branch of every session
#[derive(Debug, Default, Clone)]
pub struct GitPlugin {
    state: Rc<RefCell<GitState>>,
}

impl GitPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current repository info for a session, re-reading HEAD if it moved
    ///
    /// HEAD is checked at most once per `HEAD_CHECK_INTERVAL`; a `git`
    /// command forces a fresh lookup on the next call.
    pub fn info(&self, session_id: SessionId) -> Option<GitInfo> {
        let mut state = self.state.borrow_mut();
        if let Err(e) = state.refresh(session_id, Instant::now()) {
            debug!(session_id, error = %format!("{e:#}"), "git refresh failed");
        }
        state.sessions.get(&session_id)?.info.clone()
    }

    /// Branch name (or detached commit) for display
    pub fn branch(&self, session_id: SessionId) -> Option<String> {
        self.info(session_id).map(|info| info.head.to_string())
    }
}

impl Plugin for GitPlugin {
    fn hooks(&self) -> Vec<Hook> {
        let created = Rc::clone(&self.state);
        let moved = Rc::clone(&self.state);
        let command = Rc::clone(&self.state);
        let closed = Rc::clone(&self.state);

        vec![
            Hook::new(EventKind::TerminalCreated, move |event| match event {
                Event::TerminalCreated {
                    session_id,
                    working_directory,
                    ..
                } => created.borrow_mut().track(*session_id, working_directory),
                _ => Ok(()),
            }),
            Hook::new(EventKind::DirectoryChanged, move |event| match event {
                Event::DirectoryChanged { session_id, path } => {
                    moved.borrow_mut().track(*session_id, path)
                }
                _ => Ok(()),
            }),
            Hook::new(EventKind::CommandExecuted, move |event| {
                if let Event::CommandExecuted {
                    session_id,
                    command: line,
                } = event
                {
                    let is_git = line.split_whitespace().next() == Some("git");
                    if let Some(tracked) = command.borrow_mut().sessions.get_mut(session_id) {
                        if is_git {
                            tracked.stale = true;
                        }
                    }
                }
                Ok(())
            }),
            Hook::new(EventKind::TerminalClosed, move |event| {
                closed.borrow_mut().sessions.remove(&event.session_id());
                Ok(())
            }),
        ]
    }

    fn shutdown(&mut self) {
        self.state.borrow_mut().sessions.clear();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
