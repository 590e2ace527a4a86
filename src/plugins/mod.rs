//! Built-in plugins.
//!
//! - **git**: current branch of each session's repository
//! - **status**: the one-line status shown by the host

pub mod git;
pub mod status;

pub use git::{GitHead, GitInfo, GitPlugin};
pub use status::{StatusPlugin, StatusSnapshot};

use crate::events::plugin::{PluginRegistry, Result};

/// Registry name of the git plugin
pub const GIT: &str = "git";

/// Registry name of the status plugin
pub const STATUS: &str = "status";

/// Register every built-in plugin
pub fn register_builtin(registry: &mut PluginRegistry) -> Result<()> {
    registry.register(STATUS, StatusPlugin::new())?;
    registry.register(GIT, GitPlugin::new())?;
    Ok(())
}
