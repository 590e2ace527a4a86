//! User interface and input handling.
//!
//! - **keymapper**: keyboard input to PTY byte sequences and host commands
//! - **host**: raw-mode terminal front end driving the session registry

pub mod host;
pub mod keymapper;

pub use host::{Host, HostOptions, ScreenStore, ScreenWidget};
pub use keymapper::{HostCommand, KeyAction, KeyMapper};
