//! Event bus and plugin hooks.
//!
//! - **bus**: synchronous publish/subscribe for session lifecycle events
//! - **plugin**: the `Plugin` trait and the registry wiring plugin hooks
//!   into the bus
//!
//! ```text
//! SessionRegistry / TerminalSession ──emit──▶ EventBus ──▶ subscribers
//!                                                 ▲
//!                      PluginRegistry ──subscribe─┘
//! ```

pub mod bus;
pub mod plugin;

pub use bus::{EmitSummary, Event, EventBus, EventKind, EventRecord, SubscriptionId};
pub use plugin::{Hook, Plugin, PluginError, PluginRegistry};
