//! Interactive front end
//!
//! The host puts the real terminal in raw mode and acts as the display for
//! every session: the focused session's output goes straight to stdout,
//! the others are kept in a bounded backlog and replayed when focused.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::event::{self, DisableBracketedPaste, EnableBracketedPaste, Event as TermEvent};
use crossterm::execute;
use crossterm::terminal::{self, SetTitle};
use tracing::{debug, error, info, warn};

use super::keymapper::{HostCommand, KeyAction, KeyMapper};
use crate::config::Config;
use crate::core::pty::{PtySpawner, TermSize};
use crate::core::session::TerminalWidget;
use crate::core::SessionId;
use crate::events::{EventBus, EventKind, PluginRegistry};
use crate::history::Direction;
use crate::plugins::{self, GitPlugin, StatusPlugin};
use crate::wm::{CloseOutcome, SessionRegistry, WidgetFactory};

/// How long to wait for terminal input per loop iteration
const POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Home cursor, reset attributes, clear screen
const RESET_SCREEN: &[u8] = b"\x1b[H\x1b[0m\x1b[2J";

/// Average bytes per line assumed when bounding a backlog
const BYTES_PER_LINE: usize = 256;

/// Recent output of one session, bounded by line count
#[derive(Debug)]
struct Backlog {
    data: VecDeque<u8>,
    lines: usize,
    max_lines: usize,
}

impl Backlog {
    fn new(max_lines: usize) -> Self {
        Self {
            data: VecDeque::new(),
            lines: 0,
            max_lines: max_lines.max(1),
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.data.extend(chunk);
        self.lines += chunk.iter().filter(|&&b| b == b'\n').count();

        while self.lines + usize::from(self.open_line()) > self.max_lines {
            match self.data.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.data.drain(..=pos);
                    self.lines -= 1;
                }
                None => break,
            }
        }
        let max_bytes = self.max_lines * BYTES_PER_LINE;
        if self.data.len() > max_bytes {
            let excess = self.data.len() - max_bytes;
            let dropped = self.data.drain(..excess).filter(|&b| b == b'\n').count();
            self.lines -= dropped;
        }
    }

    /// The last line has not been terminated yet
    fn open_line(&self) -> bool {
        matches!(self.data.back(), Some(&b) if b != b'\n')
    }

    fn bytes(&self) -> Vec<u8> {
        self.data.iter().copied().collect()
    }
}

struct ScreenState {
    out: Box<dyn Write>,
    focused: Option<SessionId>,
    backlogs: HashMap<SessionId, Backlog>,
    scrollback_lines: usize,
}

impl ScreenState {
    fn emit(&mut self, data: &[u8]) {
        if let Err(e) = self.out.write_all(data).and_then(|_| self.out.flush()) {
            debug!(error = %e, "screen write failed");
        }
    }
}

/// The shared screen every `ScreenWidget` draws into
#[derive(Clone)]
pub struct ScreenStore {
    state: Rc<RefCell<ScreenState>>,
}

impl ScreenStore {
    pub fn new(out: Box<dyn Write>, scrollback_lines: usize) -> Self {
        Self {
            state: Rc::new(RefCell::new(ScreenState {
                out,
                focused: None,
                backlogs: HashMap::new(),
                scrollback_lines,
            })),
        }
    }

    pub fn widget(&self, id: SessionId) -> ScreenWidget {
        ScreenWidget {
            id,
            store: self.clone(),
        }
    }

    pub fn focused(&self) -> Option<SessionId> {
        self.state.borrow().focused
    }

    /// Show `id`, redrawing from its backlog if it was not already shown
    pub fn focus(&self, id: Option<SessionId>) {
        let mut state = self.state.borrow_mut();
        if state.focused == id {
            return;
        }
        state.focused = id;
        let replay = id
            .and_then(|id| state.backlogs.get(&id))
            .map(Backlog::bytes)
            .unwrap_or_default();
        state.emit(RESET_SCREEN);
        state.emit(&replay);
    }

    /// Drop a closed session's backlog
    pub fn forget(&self, id: SessionId) {
        self.state.borrow_mut().backlogs.remove(&id);
    }

    /// One-line message on the bottom row, cursor left where it was
    pub fn notice(&self, rows: u16, text: &str) {
        let line = format!("\x1b7\x1b[{};1H\x1b[7m {} \x1b[0m\x1b[K\x1b8", rows.max(1), text);
        self.state.borrow_mut().emit(line.as_bytes());
    }

    fn write(&self, id: SessionId, data: &[u8]) {
        let mut state = self.state.borrow_mut();
        let limit = state.scrollback_lines;
        state
            .backlogs
            .entry(id)
            .or_insert_with(|| Backlog::new(limit))
            .push(data);
        if state.focused == Some(id) {
            state.emit(data);
        }
    }
}

/// Display for one session
pub struct ScreenWidget {
    id: SessionId,
    store: ScreenStore,
}

impl TerminalWidget for ScreenWidget {
    fn write(&mut self, data: &[u8]) {
        self.store.write(self.id, data);
    }

    // The host terminal is the same size for every session
    fn resize(&mut self, _size: TermSize) {}
}

/// Startup choices that override the config file
#[derive(Debug, Clone, Default)]
pub struct HostOptions {
    pub shell: Option<String>,
    pub directory: Option<std::path::PathBuf>,
}

pub struct Host {
    registry: SessionRegistry,
    plugins: PluginRegistry,
    screen: ScreenStore,
    keys: KeyMapper,
    clipboard: Option<arboard::Clipboard>,
    size: TermSize,
    title: String,
    quit: bool,
}

impl Host {
    /// Wire up the bus, plugins and registry and start the first session
    pub fn new(config: &Config, options: HostOptions) -> Result<Self> {
        let (cols, rows) = terminal::size().context("failed to query terminal size")?;
        let size = TermSize::new(cols, rows);

        let bus = Rc::new(EventBus::new(config.events.history_limit));
        let mut plugins = PluginRegistry::new(Rc::clone(&bus));
        plugins::register_builtin(&mut plugins)?;

        let screen = ScreenStore::new(Box::new(io::stdout()), config.scrollback_lines);
        let forget = screen.clone();
        bus.subscribe(EventKind::TerminalClosed, 0, move |event| {
            forget.forget(event.session_id());
            Ok(())
        });

        let mut session_options = config.session_options(size);
        // Lets shells and scripts detect they run inside rinawarp
        session_options.env.push(("RINAWARP".to_string(), "1".to_string()));
        session_options.env.push((
            "RINAWARP_VERSION".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ));
        if let Some(shell) = options.shell {
            session_options.shell = shell;
        }
        if let Some(dir) = options.directory {
            session_options.working_directory = Some(dir);
        }
        info!(shell = %session_options.shell, cols, rows, "starting host");

        let store = screen.clone();
        let widgets: WidgetFactory = Box::new(move |id, _size| Box::new(store.widget(id)));
        let mut registry =
            SessionRegistry::new(session_options, Box::new(PtySpawner), widgets, bus);
        registry
            .create_session()
            .context("failed to start the first session")?;

        let clipboard = match arboard::Clipboard::new() {
            Ok(clipboard) => Some(clipboard),
            Err(e) => {
                debug!(error = %e, "clipboard unavailable");
                None
            }
        };

        Ok(Self {
            registry,
            plugins,
            screen,
            keys: KeyMapper::new(config.keys.prefix),
            clipboard,
            size,
            title: String::new(),
            quit: false,
        })
    }

    /// Run until the user quits, then tear everything down
    pub fn run(&mut self) -> Result<()> {
        terminal::enable_raw_mode()?;
        execute!(io::stdout(), EnableBracketedPaste)?;

        let result = self.event_loop();

        self.registry.shutdown();
        self.plugins.shutdown_all();
        let _ = execute!(io::stdout(), DisableBracketedPaste);
        let _ = terminal::disable_raw_mode();
        let _ = io::stdout().write_all(b"\x1b[0m\r\n");
        let _ = io::stdout().flush();

        result
    }

    fn event_loop(&mut self) -> Result<()> {
        while !self.quit {
            self.registry.process_events();
            self.screen.focus(self.registry.active_id());
            self.refresh_title()?;

            if event::poll(POLL_TIMEOUT)? {
                match event::read()? {
                    TermEvent::Key(key) => match self.keys.translate(&key) {
                        Some(KeyAction::Send(bytes)) => self.send_input(&bytes),
                        Some(KeyAction::Host(command)) => self.run_command(command),
                        None => {}
                    },
                    TermEvent::Paste(text) => self.paste(&text),
                    TermEvent::Resize(cols, rows) => {
                        self.size = TermSize::new(cols, rows);
                        self.registry.resize_all(self.size);
                    }
                    _ => {}
                }
            }
        }
        info!("host loop finished");
        Ok(())
    }

    fn send_input(&mut self, data: &[u8]) {
        let Some(session) = self.registry.active_session_mut() else {
            return;
        };
        if let Err(e) = session.on_user_input(data) {
            warn!(session_id = session.id(), error = %e, "input not delivered");
        }
    }

    fn paste(&mut self, text: &str) {
        let Some(session) = self.registry.active_session_mut() else {
            return;
        };
        if let Err(e) = session.paste(text) {
            warn!(session_id = session.id(), error = %e, "paste not delivered");
        }
    }

    fn run_command(&mut self, command: HostCommand) {
        debug!(?command, "host command");
        match command {
            HostCommand::NewSession => {
                if let Err(e) = self.registry.create_session() {
                    error!(error = %e, "new session failed");
                    self.screen
                        .notice(self.size.rows, &format!("could not start shell: {e}"));
                }
            }
            HostCommand::NextSession => {
                self.registry.cycle(true);
            }
            HostCommand::PrevSession => {
                self.registry.cycle(false);
            }
            HostCommand::CloseSession => {
                if let Some(id) = self.registry.active_id() {
                    if self.registry.close_session(id) == CloseOutcome::LastSession {
                        self.screen.notice(self.size.rows, "the last session stays open");
                    }
                }
            }
            HostCommand::GotoSession(index) => {
                self.registry.goto(index);
            }
            HostCommand::Paste => {
                let text = self.clipboard.as_mut().and_then(|c| c.get_text().ok());
                if let Some(text) = text {
                    self.paste(&text);
                }
            }
            HostCommand::HistoryOlder | HostCommand::HistoryNewer => {
                let direction = if command == HostCommand::HistoryOlder {
                    Direction::Older
                } else {
                    Direction::Newer
                };
                if let Some(session) = self.registry.active_session_mut() {
                    if let Err(e) = session.recall(direction) {
                        warn!(session_id = session.id(), error = %e, "history recall failed");
                    }
                }
            }
            HostCommand::Quit => self.quit = true,
        }
    }

    /// Put the status line and branch in the terminal title
    fn refresh_title(&mut self) -> Result<()> {
        let status = self
            .plugins
            .get_as::<StatusPlugin>(plugins::STATUS)
            .map(|s| s.render(usize::from(self.size.cols)))
            .unwrap_or_default();
        let branch = self.registry.active_id().and_then(|id| {
            self.plugins
                .get_as::<GitPlugin>(plugins::GIT)
                .and_then(|git| git.branch(id))
        });

        let title = match branch {
            Some(branch) => format!("rinawarp {status} ({branch})"),
            None => format!("rinawarp {status}"),
        };
        if title != self.title {
            execute!(io::stdout(), SetTitle(&title))?;
            self.title = title;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn take(&self) -> Vec<u8> {
            std::mem::take(&mut *self.0.borrow_mut())
        }
    }

    #[test]
    fn test_backlog_keeps_last_lines() {
        let mut backlog = Backlog::new(2);
        backlog.push(b"one\r\ntwo\r\n");
        backlog.push(b"three\r\nfour");

        assert_eq!(backlog.bytes(), b"three\r\nfour".to_vec());
        assert_eq!(backlog.lines, 1);

        // Completing the open line keeps it
        backlog.push(b"\r\n");
        assert_eq!(backlog.bytes(), b"three\r\nfour\r\n".to_vec());
        backlog.push(b"five");
        assert_eq!(backlog.bytes(), b"four\r\nfive".to_vec());
    }

    #[test]
    fn test_backlog_bounds_long_lines() {
        let mut backlog = Backlog::new(1);
        backlog.push(&vec![b'x'; BYTES_PER_LINE * 3]);
        assert_eq!(backlog.bytes().len(), BYTES_PER_LINE);
    }

    #[test]
    fn test_only_focused_session_reaches_screen() {
        let out = SharedBuf::default();
        let screen = ScreenStore::new(Box::new(out.clone()), 100);
        let mut first = screen.widget(1);
        let mut second = screen.widget(2);

        screen.focus(Some(1));
        assert_eq!(screen.focused(), Some(1));
        out.take();
        first.write(b"visible");
        second.write(b"hidden");
        assert_eq!(out.take(), b"visible".to_vec());
    }

    #[test]
    fn test_focus_replays_backlog() {
        let out = SharedBuf::default();
        let screen = ScreenStore::new(Box::new(out.clone()), 100);
        let mut first = screen.widget(1);
        let mut second = screen.widget(2);

        screen.focus(Some(1));
        first.write(b"a$ ");
        second.write(b"b$ ls\r\n");
        out.take();

        screen.focus(Some(2));
        let mut expected = RESET_SCREEN.to_vec();
        expected.extend_from_slice(b"b$ ls\r\n");
        assert_eq!(out.take(), expected);

        // Refocusing the same session draws nothing
        screen.focus(Some(2));
        assert!(out.take().is_empty());
    }

    #[test]
    fn test_forget_drops_backlog() {
        let out = SharedBuf::default();
        let screen = ScreenStore::new(Box::new(out.clone()), 100);
        screen.widget(3).write(b"gone");
        screen.forget(3);

        screen.focus(Some(3));
        assert_eq!(out.take(), RESET_SCREEN.to_vec());
    }

    #[test]
    fn test_notice_restores_cursor() {
        let out = SharedBuf::default();
        let screen = ScreenStore::new(Box::new(out.clone()), 100);
        screen.notice(24, "could not start shell");

        let text = String::from_utf8(out.take()).unwrap();
        assert!(text.starts_with("\x1b7\x1b[24;1H"));
        assert!(text.contains("could not start shell"));
        assert!(text.ends_with("\x1b8"));
    }
}
