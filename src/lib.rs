//! rinawarp - multi-session PTY terminal core
//!
//! Each session owns a shell running on a pseudo-terminal. The registry keeps
//! track of the sessions and which one has focus, lifecycle and command events
//! go out on an event bus, and plugins hook into that bus.

pub mod config;
pub mod core;
pub mod events;
pub mod history;
pub mod plugins;
pub mod ui;
pub mod wm;
