//! Session registry - owns every live terminal session and tracks the
//! active one. Once a session exists there is always at least one until
//! `shutdown`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, trace, warn};

use crate::core::pty::{self, ProcessEvent, ProcessSpawner, SpawnRequest, TermSize};
use crate::core::session::{TerminalSession, TerminalWidget};
use crate::core::SessionId;
use crate::events::{Event, EventBus};
use crate::history::{CommandHistoryStore, HISTORY_LIMIT, SUGGESTION_LIMIT};

/// Upper bound on process events handled per pump
const MAX_EVENTS_PER_PUMP: usize = 512;

/// Builds the display widget for a new session
pub type WidgetFactory = Box<dyn FnMut(SessionId, TermSize) -> Box<dyn TerminalWidget>>;

/// How new sessions are launched
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub shell: String,
    pub shell_args: Vec<String>,
    /// Start directory when there is no active session to inherit from
    pub working_directory: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub size: TermSize,
    /// Time a shell gets to leave after hangup before it is killed
    pub grace_period: Duration,
    pub history_limit: usize,
    pub suggestion_limit: usize,
    pub ignore_sensitive: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            shell_args: Vec::new(),
            working_directory: None,
            env: Vec::new(),
            size: TermSize::default(),
            grace_period: Duration::from_millis(500),
            history_limit: HISTORY_LIMIT,
            suggestion_limit: SUGGESTION_LIMIT,
            ignore_sensitive: false,
        }
    }
}

/// Result of `close_session`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    /// No live session with that id
    NotFound,
    /// Refused: the last session always stays open
    LastSession,
}

pub struct SessionRegistry {
    sessions: BTreeMap<SessionId, TerminalSession>,
    active: Option<SessionId>,
    /// Never reused, even for failed spawns
    next_id: SessionId,
    options: SessionOptions,
    spawner: Box<dyn ProcessSpawner>,
    widgets: WidgetFactory,
    bus: Rc<EventBus>,
    events_tx: Sender<ProcessEvent>,
    events_rx: Receiver<ProcessEvent>,
}

impl SessionRegistry {
    pub fn new(
        options: SessionOptions,
        spawner: Box<dyn ProcessSpawner>,
        widgets: WidgetFactory,
        bus: Rc<EventBus>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            sessions: BTreeMap::new(),
            active: None,
            next_id: 1,
            options,
            spawner,
            widgets,
            bus,
            events_tx,
            events_rx,
        }
    }

    pub fn bus(&self) -> &Rc<EventBus> {
        &self.bus
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Create a session in the active session's directory (or the
    /// configured/current one) and make it active
    pub fn create_session(&mut self) -> pty::Result<SessionId> {
        let cwd = self.default_directory();
        self.create_session_in(cwd)
    }

    pub fn create_session_in(&mut self, cwd: PathBuf) -> pty::Result<SessionId> {
        let id = self.next_id;
        self.next_id += 1;

        let size = self.options.size;
        let request = SpawnRequest {
            session_id: id,
            shell: self.options.shell.clone(),
            args: self.options.shell_args.clone(),
            cwd,
            env: self.options.env.clone(),
            size,
        };
        let history = CommandHistoryStore::with_limit(self.options.history_limit)
            .ignore_sensitive(self.options.ignore_sensitive)
            .suggestion_limit(self.options.suggestion_limit);
        let widget = (self.widgets)(id, size);

        let session = TerminalSession::spawn(
            self.spawner.as_ref(),
            &request,
            self.events_tx.clone(),
            widget,
            history,
            Rc::clone(&self.bus),
        )
        .map_err(|e| {
            warn!(session_id = id, shell = %request.shell, error = %e, "failed to create session");
            e
        })?;

        let working_directory = session.cwd().to_path_buf();
        self.sessions.insert(id, session);
        self.active = Some(id);
        info!(session_id = id, sessions = self.sessions.len(), "session created");

        self.bus.emit(&Event::TerminalCreated {
            session_id: id,
            working_directory,
            timestamp: SystemTime::now(),
        });
        Ok(id)
    }

    /// Close a session, terminating its shell
    pub fn close_session(&mut self, id: SessionId) -> CloseOutcome {
        if !self.sessions.contains_key(&id) {
            warn!(session_id = id, "close requested for unknown session");
            return CloseOutcome::NotFound;
        }
        if self.sessions.len() == 1 {
            info!(session_id = id, "refusing to close the last session");
            return CloseOutcome::LastSession;
        }

        let Some(mut session) = self.sessions.remove(&id) else {
            return CloseOutcome::NotFound;
        };
        if let Err(e) = session.terminate(self.options.grace_period) {
            warn!(session_id = id, error = %e, "failed to terminate shell");
        }
        drop(session);

        // Lowest remaining id takes over
        let switched = if self.active == Some(id) {
            self.active = self.sessions.keys().next().copied();
            self.active
        } else {
            None
        };
        info!(session_id = id, active = ?self.active, "session closed");

        self.bus.emit(&Event::TerminalClosed {
            session_id: id,
            timestamp: SystemTime::now(),
        });
        if let Some(to) = switched {
            self.bus.emit(&Event::SessionSwitched {
                from: Some(id),
                to,
            });
        }
        CloseOutcome::Closed
    }

    /// Make `id` active. Returns `false` if it is not a live session.
    pub fn switch_to(&mut self, id: SessionId) -> bool {
        if !self.sessions.contains_key(&id) {
            warn!(session_id = id, "switch requested to unknown session");
            return false;
        }
        if self.active == Some(id) {
            return true;
        }

        let from = self.active.replace(id);
        debug!(?from, to = id, "switched session");
        self.bus.emit(&Event::SessionSwitched { from, to: id });
        true
    }

    /// Switch to the next (or previous) session in id order, wrapping
    pub fn cycle(&mut self, forward: bool) -> Option<SessionId> {
        let ids = self.ids();
        let pos = ids.iter().position(|&id| Some(id) == self.active)?;
        let next = if forward {
            ids[(pos + 1) % ids.len()]
        } else {
            ids[(pos + ids.len() - 1) % ids.len()]
        };
        self.switch_to(next);
        Some(next)
    }

    /// Switch to the `index`th session in id order
    pub fn goto(&mut self, index: usize) -> bool {
        match self.sessions.keys().nth(index).copied() {
            Some(id) => self.switch_to(id),
            None => false,
        }
    }

    pub fn active_id(&self) -> Option<SessionId> {
        self.active
    }

    pub fn active_session(&self) -> Option<&TerminalSession> {
        self.active.and_then(|id| self.sessions.get(&id))
    }

    pub fn active_session_mut(&mut self) -> Option<&mut TerminalSession> {
        let id = self.active?;
        self.sessions.get_mut(&id)
    }

    pub fn session(&self, id: SessionId) -> Option<&TerminalSession> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut TerminalSession> {
        self.sessions.get_mut(&id)
    }

    /// Live session ids, ascending
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Deliver pending shell output and notice exited shells
    ///
    /// Returns the number of output chunks delivered. When the pump stops
    /// at its cap, only sessions that already saw EOF are checked for exit;
    /// the rest may still have output waiting in the channel.
    pub fn process_events(&mut self) -> usize {
        let mut delivered = 0;
        let mut drained = false;
        for _ in 0..MAX_EVENTS_PER_PUMP {
            let event = match self.events_rx.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                    drained = true;
                    break;
                }
            };
            match event {
                ProcessEvent::Output { session_id, data } => {
                    match self.sessions.get_mut(&session_id) {
                        Some(session) => {
                            session.on_output_chunk(&data);
                            delivered += 1;
                        }
                        None => trace!(session_id, len = data.len(), "output for closed session"),
                    }
                }
                ProcessEvent::Eof { session_id } => {
                    if let Some(session) = self.sessions.get_mut(&session_id) {
                        session.on_output_closed();
                    }
                }
            }
        }

        for session in self.sessions.values_mut() {
            if drained || session.output_closed() {
                session.poll_exit();
            }
        }
        delivered
    }

    /// Resize every session, and the default for new ones
    pub fn resize_all(&mut self, size: TermSize) {
        self.options.size = size;
        for (id, session) in &mut self.sessions {
            if let Err(e) = session.resize(size) {
                warn!(session_id = *id, error = %e, "resize failed");
            }
        }
    }

    /// Terminate every session
    pub fn shutdown(&mut self) {
        let grace = self.options.grace_period;
        for (id, mut session) in std::mem::take(&mut self.sessions) {
            if let Err(e) = session.terminate(grace) {
                warn!(session_id = id, error = %e, "failed to terminate shell");
            }
            drop(session);
            self.bus.emit(&Event::TerminalClosed {
                session_id: id,
                timestamp: SystemTime::now(),
            });
        }
        self.active = None;
        while self.events_rx.try_recv().is_ok() {}
        info!("all sessions closed");
    }

    fn default_directory(&self) -> PathBuf {
        if let Some(session) = self.active_session() {
            if session.cwd().is_dir() {
                return session.cwd().to_path_buf();
            }
        }
        if let Some(dir) = &self.options.working_directory {
            return dir.clone();
        }
        std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir())
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if !self.sessions.is_empty() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pty::{ExitInfo, Signal};
    use crate::core::session::EXIT_MARKER;
    use crate::core::testing::{FakeSpawner, RecordingWidget};
    use crate::events::EventKind;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct Fixture {
        spawner: FakeSpawner,
        widgets: Rc<RefCell<HashMap<SessionId, RecordingWidget>>>,
        events: Rc<RefCell<Vec<Event>>>,
        registry: SessionRegistry,
    }

    fn fixture() -> Fixture {
        let spawner = FakeSpawner::new();
        let widgets = Rc::new(RefCell::new(HashMap::new()));
        let bus = Rc::new(EventBus::default());

        let events = Rc::new(RefCell::new(Vec::new()));
        for kind in EventKind::ALL {
            let sink = Rc::clone(&events);
            bus.subscribe(kind, 0, move |event| {
                sink.borrow_mut().push(event.clone());
                Ok(())
            });
        }

        let made = Rc::clone(&widgets);
        let factory: WidgetFactory = Box::new(move |id, _size| {
            let widget = RecordingWidget::new();
            made.borrow_mut().insert(id, widget.clone());
            Box::new(widget)
        });
        let options = SessionOptions {
            working_directory: Some(std::env::temp_dir()),
            grace_period: Duration::from_millis(20),
            ..SessionOptions::default()
        };
        let registry = SessionRegistry::new(options, Box::new(spawner.clone()), factory, bus);

        Fixture {
            spawner,
            widgets,
            events,
            registry,
        }
    }

    fn kinds(f: &Fixture) -> Vec<EventKind> {
        f.events.borrow().iter().map(Event::kind).collect()
    }

    fn check_invariants(registry: &SessionRegistry) {
        if !registry.is_empty() {
            let active = registry.active_id().unwrap();
            assert!(registry.ids().contains(&active));
            assert_eq!(registry.active_session().unwrap().id(), active);
        }
    }

    #[test]
    fn test_create_and_close_scenario() {
        let mut f = fixture();
        assert!(f.registry.active_session().is_none());

        assert_eq!(f.registry.create_session().unwrap(), 1);
        assert_eq!(f.registry.active_id(), Some(1));
        assert_eq!(f.registry.create_session().unwrap(), 2);
        assert_eq!(f.registry.active_id(), Some(2));

        assert_eq!(f.registry.close_session(1), CloseOutcome::Closed);
        assert_eq!(f.registry.ids(), [2]);
        assert_eq!(f.registry.active_id(), Some(2));

        assert_eq!(f.registry.close_session(2), CloseOutcome::LastSession);
        assert_eq!(f.registry.ids(), [2]);
        assert!(!f.spawner.process(2).borrow().signals.contains(&Signal::Hangup));

        assert_eq!(
            kinds(&f),
            [
                EventKind::TerminalCreated,
                EventKind::TerminalCreated,
                EventKind::TerminalClosed
            ]
        );
    }

    #[test]
    fn test_closing_active_promotes_lowest_id() {
        let mut f = fixture();
        for _ in 0..4 {
            f.registry.create_session().unwrap();
        }
        f.registry.close_session(2);
        assert!(f.registry.switch_to(3));
        f.events.borrow_mut().clear();

        assert_eq!(f.registry.close_session(3), CloseOutcome::Closed);
        assert_eq!(f.registry.ids(), [1, 4]);
        assert_eq!(f.registry.active_id(), Some(1));
        assert_eq!(
            f.events.borrow().last(),
            Some(&Event::SessionSwitched {
                from: Some(3),
                to: 1
            })
        );
    }

    #[test]
    fn test_close_terminates_shell() {
        let mut f = fixture();
        f.registry.create_session().unwrap();
        f.registry.create_session().unwrap();

        f.registry.close_session(1);
        assert_eq!(f.spawner.process(1).borrow().signals, vec![Signal::Hangup]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut f = fixture();
        for _ in 0..3 {
            f.registry.create_session().unwrap();
        }

        assert_eq!(f.registry.close_session(2), CloseOutcome::Closed);
        assert_eq!(f.registry.close_session(2), CloseOutcome::NotFound);
        assert_eq!(f.registry.close_session(99), CloseOutcome::NotFound);
        assert_eq!(f.registry.ids(), [1, 3]);
    }

    #[test]
    fn test_failed_spawn_leaves_state_and_burns_id() {
        let mut f = fixture();
        f.registry.create_session().unwrap();

        f.spawner.fail_spawns(true);
        let err = f.registry.create_session().unwrap_err();
        assert!(err.is_spawn_error());
        assert_eq!(f.registry.ids(), [1]);
        assert_eq!(f.registry.active_id(), Some(1));

        f.spawner.fail_spawns(false);
        assert_eq!(f.registry.create_session().unwrap(), 3);
        assert_eq!(
            kinds(&f),
            [EventKind::TerminalCreated, EventKind::TerminalCreated]
        );
    }

    #[test]
    fn test_bad_directory_is_a_spawn_error() {
        let mut f = fixture();
        let err = f
            .registry
            .create_session_in(PathBuf::from("/no/such/place"))
            .unwrap_err();

        assert!(err.is_spawn_error());
        assert!(f.registry.is_empty());
        assert_eq!(f.spawner.spawn_count(), 0);
    }

    #[test]
    fn test_switch_to() {
        let mut f = fixture();
        f.registry.create_session().unwrap();
        f.registry.create_session().unwrap();
        f.events.borrow_mut().clear();

        assert!(!f.registry.switch_to(7));
        assert_eq!(f.registry.active_id(), Some(2));

        assert!(f.registry.switch_to(1));
        assert_eq!(f.registry.active_id(), Some(1));
        assert_eq!(
            *f.events.borrow(),
            [Event::SessionSwitched {
                from: Some(2),
                to: 1
            }]
        );
    }

    #[test]
    fn test_cycle_and_goto() {
        let mut f = fixture();
        for _ in 0..3 {
            f.registry.create_session().unwrap();
        }

        assert_eq!(f.registry.cycle(true), Some(1));
        assert_eq!(f.registry.cycle(false), Some(3));
        assert_eq!(f.registry.cycle(false), Some(2));
        assert!(f.registry.goto(0));
        assert_eq!(f.registry.active_id(), Some(1));
        assert!(!f.registry.goto(5));
    }

    #[test]
    fn test_output_routed_in_order() {
        let mut f = fixture();
        f.registry.create_session().unwrap();
        f.registry.create_session().unwrap();

        f.spawner.emit_output(1, b"one ");
        f.spawner.emit_output(2, b"two");
        f.spawner.emit_output(1, b"more");
        assert_eq!(f.registry.process_events(), 3);

        let widgets = f.widgets.borrow();
        assert_eq!(widgets[&1].text(), "one more");
        assert_eq!(widgets[&2].text(), "two");
    }

    #[test]
    fn test_output_for_closed_session_dropped() {
        let mut f = fixture();
        f.registry.create_session().unwrap();
        f.registry.create_session().unwrap();

        f.spawner.emit_output(1, b"late");
        f.registry.close_session(1);
        assert_eq!(f.registry.process_events(), 0);
        assert_eq!(f.widgets.borrow()[&1].text(), "");
    }

    #[test]
    fn test_exited_shell_keeps_session_open() {
        let mut f = fixture();
        f.registry.create_session().unwrap();
        f.registry.create_session().unwrap();

        f.spawner.emit_output(2, b"logout");
        f.spawner.exit(2, ExitInfo::with_code(0));
        f.registry.process_events();

        assert_eq!(f.registry.ids(), [1, 2]);
        assert!(f.registry.session(2).unwrap().is_exited());
        let text = f.widgets.borrow()[&2].text();
        assert!(text.starts_with("logout"));
        assert!(text.ends_with(std::str::from_utf8(EXIT_MARKER).unwrap()));
        assert_eq!(kinds(&f).last(), Some(&EventKind::ProcessExited));
    }

    #[test]
    fn test_exit_marker_waits_behind_busy_neighbour() {
        let mut f = fixture();
        f.registry.create_session().unwrap();
        f.registry.create_session().unwrap();

        for _ in 0..600 {
            f.spawner.emit_output(1, b"y\n");
        }
        f.spawner.emit_output(2, b"logout");
        f.spawner.exit(2, ExitInfo::with_code(0));

        assert_eq!(f.registry.process_events(), MAX_EVENTS_PER_PUMP);
        assert!(!f.registry.session(2).unwrap().is_exited());
        assert_eq!(f.widgets.borrow()[&2].text(), "");

        f.registry.process_events();
        assert!(f.registry.session(2).unwrap().is_exited());
        let marker = std::str::from_utf8(EXIT_MARKER).unwrap();
        assert_eq!(f.widgets.borrow()[&2].text(), format!("logout{marker}"));
    }

    #[test]
    fn test_new_session_inherits_directory() {
        let mut f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().canonicalize().unwrap();

        f.registry.create_session().unwrap();
        let osc = format!("\x1b]7;file://localhost{}\x07", path.display());
        f.spawner.emit_output(1, osc.as_bytes());
        f.registry.process_events();

        let id = f.registry.create_session().unwrap();
        let request = f.spawner.process(id).borrow().request.clone().unwrap();
        assert_eq!(request.cwd, path);
    }

    #[test]
    fn test_resize_all() {
        let mut f = fixture();
        f.registry.create_session().unwrap();
        f.registry.create_session().unwrap();

        f.registry.resize_all(TermSize::new(132, 50));
        for id in [1, 2] {
            assert_eq!(
                f.spawner.process(id).borrow().resizes,
                vec![TermSize::new(132, 50)]
            );
        }
        f.registry.create_session().unwrap();
        let request = f.spawner.process(3).borrow().request.clone().unwrap();
        assert_eq!(request.size, TermSize::new(132, 50));
    }

    #[test]
    fn test_input_reaches_chosen_session() {
        let mut f = fixture();
        f.registry.create_session().unwrap();
        f.registry.create_session().unwrap();
        assert_eq!(f.registry.options().grace_period, Duration::from_millis(20));

        f.registry.session_mut(1).unwrap().on_user_input(b"pwd\r").unwrap();
        assert_eq!(f.spawner.process(1).borrow().writes, b"pwd\r".to_vec());
        assert!(f.spawner.process(2).borrow().writes.is_empty());
        assert!(f.registry.session_mut(9).is_none());
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let mut f = fixture();
        for _ in 0..3 {
            f.registry.create_session().unwrap();
        }
        f.events.borrow_mut().clear();

        f.registry.shutdown();
        assert!(f.registry.is_empty());
        assert_eq!(f.registry.active_id(), None);
        assert_eq!(kinds(&f), [EventKind::TerminalClosed; 3]);
        for id in 1..=3 {
            assert!(f.spawner.process(id).borrow().exit.is_some());
        }
    }

    #[test]
    fn test_invariants_hold_over_mixed_operations() {
        let mut f = fixture();
        let mut seed: u64 = 0x2545_f491;
        f.registry.create_session().unwrap();

        for _ in 0..200 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            match seed % 4 {
                0 => {
                    f.registry.create_session().unwrap();
                }
                1 | 2 => {
                    let ids = f.registry.ids();
                    let target = ids[(seed as usize / 4) % ids.len()];
                    f.registry.close_session(target);
                }
                _ => {
                    let ids = f.registry.ids();
                    f.registry.switch_to(ids[(seed as usize / 4) % ids.len()]);
                }
            }
            assert!(!f.registry.is_empty());
            check_invariants(&f.registry);
        }
    }
}
