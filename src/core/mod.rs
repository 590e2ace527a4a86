//! Core terminal session components.
//!
//! This module contains the process-facing half of the terminal:
//!
//! - **pty**: shell processes on a pseudo terminal, signal delivery, the
//!   spawner seam and the `portable-pty` backed spawner
//! - **session**: a shell process paired with a display widget
//!
//! # Architecture
//!
//! ```text
//! TerminalSession
//! ├── ShellProcessHandle (PTY I/O with shell process)
//! ├── TerminalWidget     (external display, fed raw bytes)
//! └── CommandHistoryStore
//! ```
//!
//! Output is read on one thread per shell and handed back to the event loop
//! as `ProcessEvent`s; everything else runs on the event-loop thread.

pub mod pty;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

/// Unique identifier for a session, never reused within a registry
pub type SessionId = u64;
