//! Session management.
//!
//! - **registry**: `SessionRegistry`, the set of live sessions and which one
//!   has focus

pub mod registry;

pub use registry::{CloseOutcome, SessionOptions, SessionRegistry, WidgetFactory};
