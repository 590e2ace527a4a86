//! Synchronous in-process event bus
//!
//! Subscribers for an event run in priority order (highest first, insertion
//! order among equals) on the emitting thread. A failing or panicking
//! subscriber is logged and skipped; it never reaches the emitter or the
//! subscribers after it. Emitting from inside a subscriber is allowed.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::SystemTime;

use tracing::{error, trace, warn};

use crate::core::pty::ExitInfo;
use crate::core::SessionId;

/// Default number of emitted events kept for inspection
pub const EVENT_HISTORY_LIMIT: usize = 1000;

/// Event names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    TerminalCreated,
    TerminalClosed,
    SessionSwitched,
    CommandExecuted,
    DirectoryChanged,
    ProcessExited,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::TerminalCreated,
        EventKind::TerminalClosed,
        EventKind::SessionSwitched,
        EventKind::CommandExecuted,
        EventKind::DirectoryChanged,
        EventKind::ProcessExited,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::TerminalCreated => "terminal-created",
            EventKind::TerminalClosed => "terminal-closed",
            EventKind::SessionSwitched => "session-switched",
            EventKind::CommandExecuted => "command-executed",
            EventKind::DirectoryChanged => "directory-changed",
            EventKind::ProcessExited => "process-exited",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event payloads
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    TerminalCreated {
        session_id: SessionId,
        working_directory: PathBuf,
        timestamp: SystemTime,
    },
    TerminalClosed {
        session_id: SessionId,
        timestamp: SystemTime,
    },
    SessionSwitched {
        from: Option<SessionId>,
        to: SessionId,
    },
    CommandExecuted {
        session_id: SessionId,
        command: String,
    },
    DirectoryChanged {
        session_id: SessionId,
        path: PathBuf,
    },
    ProcessExited {
        session_id: SessionId,
        exit: ExitInfo,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::TerminalCreated { .. } => EventKind::TerminalCreated,
            Event::TerminalClosed { .. } => EventKind::TerminalClosed,
            Event::SessionSwitched { .. } => EventKind::SessionSwitched,
            Event::CommandExecuted { .. } => EventKind::CommandExecuted,
            Event::DirectoryChanged { .. } => EventKind::DirectoryChanged,
            Event::ProcessExited { .. } => EventKind::ProcessExited,
        }
    }

    /// The session the event concerns (the new one for a switch)
    pub fn session_id(&self) -> SessionId {
        match self {
            Event::TerminalCreated { session_id, .. }
            | Event::TerminalClosed { session_id, .. }
            | Event::CommandExecuted { session_id, .. }
            | Event::DirectoryChanged { session_id, .. }
            | Event::ProcessExited { session_id, .. } => *session_id,
            Event::SessionSwitched { to, .. } => *to,
        }
    }
}

/// Subscriber callback
pub type Handler = Rc<dyn Fn(&Event) -> anyhow::Result<()>>;

/// Token returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// An emitted event as kept in the bus history
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub kind: EventKind,
    pub event: Event,
    pub timestamp: SystemTime,
}

/// Outcome of one `emit`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitSummary {
    pub invoked: usize,
    pub failed: usize,
}

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    priority: i32,
    handler: Handler,
}

pub struct EventBus {
    subscribers: RefCell<HashMap<EventKind, Vec<Subscriber>>>,
    history: RefCell<VecDeque<EventRecord>>,
    history_limit: usize,
    next_id: Cell<u64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_HISTORY_LIMIT)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("history_len", &self.history.borrow().len())
            .field("history_limit", &self.history_limit)
            .finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new(history_limit: usize) -> Self {
        Self {
            subscribers: RefCell::new(HashMap::new()),
            history: RefCell::new(VecDeque::new()),
            history_limit,
            next_id: Cell::new(1),
        }
    }

    /// Subscribe `handler` to `kind`; higher `priority` runs first
    pub fn subscribe<F>(&self, kind: EventKind, priority: i32, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + 'static,
    {
        self.subscribe_handler(kind, priority, Rc::new(handler))
    }

    pub fn subscribe_handler(
        &self,
        kind: EventKind,
        priority: i32,
        handler: Handler,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.get());
        self.next_id.set(id.0 + 1);

        let mut subscribers = self.subscribers.borrow_mut();
        let list = subscribers.entry(kind).or_default();
        // After every subscriber of equal or higher priority
        let pos = list
            .iter()
            .position(|s| s.priority < priority)
            .unwrap_or(list.len());
        list.insert(
            pos,
            Subscriber {
                id,
                priority,
                handler,
            },
        );
        trace!(event = %kind, ?id, priority, "subscribed");
        id
    }

    /// Remove a subscription. Returns `false` if it was not present.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.borrow_mut();
        let Some(list) = subscribers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        before != list.len()
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers.borrow().get(&kind).map_or(0, Vec::len)
    }

    /// Record `event` and run every current subscriber for its kind
    ///
    /// Subscribers added or removed while this emit is running take effect
    /// from the next emit.
    pub fn emit(&self, event: &Event) -> EmitSummary {
        let kind = event.kind();
        self.record(kind, event);

        let snapshot: Vec<Subscriber> = self
            .subscribers
            .borrow()
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        let mut summary = EmitSummary::default();
        for subscriber in snapshot {
            summary.invoked += 1;
            let handler = &subscriber.handler;
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    summary.failed += 1;
                    let reason = format!("{e:#}");
                    warn!(event = %kind, id = ?subscriber.id, error = %reason, "event handler failed");
                }
                Err(payload) => {
                    summary.failed += 1;
                    let reason = panic_message(payload.as_ref());
                    error!(event = %kind, id = ?subscriber.id, panic = %reason, "event handler panicked");
                }
            }
        }
        summary
    }

    /// Emitted events, oldest first
    pub fn history(&self) -> Vec<EventRecord> {
        self.history.borrow().iter().cloned().collect()
    }

    fn record(&self, kind: EventKind, event: &Event) {
        if self.history_limit == 0 {
            return;
        }
        let mut history = self.history.borrow_mut();
        while history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(EventRecord {
            kind,
            event: event.clone(),
            timestamp: SystemTime::now(),
        });
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
