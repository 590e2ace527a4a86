//! Session management
//!
//! A `TerminalSession` pairs one shell with one display widget. Output is
//! passed to the widget untouched; input is forwarded to the shell while the
//! session keeps track of the command line being typed so it can feed
//! history, suggestions and the `command-executed` hook.

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use super::pty::{
    self, ExitInfo, ProcessEventSender, ProcessSpawner, ShellProcessHandle, Signal, SpawnRequest,
    TermSize,
};
use super::SessionId;
use crate::events::{Event, EventBus};
use crate::history::{CommandHistoryStore, Direction};

/// Written to the display once the shell is gone
pub const EXIT_MARKER: &[u8] = b"\r\n[Process exited]\r\n";

/// Cursor home + erase display
const CLEAR_SCREEN: &[u8] = b"\x1b[H\x1b[2J";

/// What the shell's line editor treats as backspace
const ERASE: u8 = 0x7f;

/// Longest OSC payload worth buffering
const MAX_OSC_LEN: usize = 4096;

/// Longest CSI parameter list worth buffering
const MAX_CSI_LEN: usize = 64;

/// Bracketed paste delimiters (DECSET 2004)
const PASTE_START: &[u8] = b"\x1b[200~";
const PASTE_END: &[u8] = b"\x1b[201~";

/// Exit polls without output before an exit is trusted without EOF
const QUIET_POLLS_BEFORE_EXIT: u8 = 3;

/// The display side of a session
///
/// Implementations render whatever bytes they are given; the session never
/// interprets escape sequences on their behalf.
pub trait TerminalWidget {
    fn write(&mut self, data: &[u8]);

    fn resize(&mut self, size: TermSize);
}

/// Session lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Shell launched, nothing heard from it yet
    Spawning,
    /// Shell has produced output
    Running,
    /// Shell is gone; the session stays open for review
    Exited(ExitInfo),
}

/// Keystrokes the session cares about
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Enter,
    Interrupt,
    EndOfFile,
    Suspend,
    ClearScreen,
    Erase,
    KillLine,
    /// Printable text, possibly spanning several lines when pasted
    Text(&'a str),
    /// Anything else: escape sequences, other control bytes, invalid UTF-8
    Raw,
}

fn classify(data: &[u8]) -> Input<'_> {
    match data {
        b"\r" | b"\n" | b"\r\n" => Input::Enter,
        [0x03] => Input::Interrupt,
        [0x04] => Input::EndOfFile,
        [0x1a] => Input::Suspend,
        [0x0c] => Input::ClearScreen,
        [0x7f] | [0x08] => Input::Erase,
        [0x15] => Input::KillLine,
        _ => match std::str::from_utf8(data) {
            Ok(text)
                if !text.is_empty()
                    && text
                        .chars()
                        .all(|c| !c.is_control() || matches!(c, '\r' | '\n')) =>
            {
                Input::Text(text)
            }
            _ => Input::Raw,
        },
    }
}

/// A shell session bound to a display widget
pub struct TerminalSession {
    id: SessionId,
    handle: ShellProcessHandle,
    widget: Box<dyn TerminalWidget>,
    input_buffer: String,
    history: CommandHistoryStore,
    state: SessionState,
    size: TermSize,
    cwd: PathBuf,
    created_at: SystemTime,
    bus: Rc<EventBus>,
    scanner: OutputScanner,
    /// The PTY reported end of file
    output_closed: bool,
    /// Output arrived since the last exit poll
    recent_output: bool,
    /// Consecutive exit polls that saw no output
    quiet_polls: u8,
}

impl TerminalSession {
    /// Launch a shell for `request` and attach it to `widget`
    pub fn spawn(
        spawner: &dyn ProcessSpawner,
        request: &SpawnRequest,
        events: ProcessEventSender,
        mut widget: Box<dyn TerminalWidget>,
        history: CommandHistoryStore,
        bus: Rc<EventBus>,
    ) -> pty::Result<Self> {
        let handle = ShellProcessHandle::spawn(spawner, request, events)?;
        widget.resize(request.size);

        Ok(Self {
            id: request.session_id,
            handle,
            widget,
            input_buffer: String::new(),
            history,
            state: SessionState::Spawning,
            size: request.size,
            cwd: request.cwd.clone(),
            created_at: SystemTime::now(),
            bus,
            scanner: OutputScanner::default(),
            output_closed: false,
            recent_output: false,
            quiet_polls: 0,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn handle(&self) -> &ShellProcessHandle {
        &self.handle
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_exited(&self) -> bool {
        matches!(self.state, SessionState::Exited(_))
    }

    /// The command line typed so far
    pub fn input_buffer(&self) -> &str {
        &self.input_buffer
    }

    pub fn history(&self) -> &CommandHistoryStore {
        &self.history
    }

    /// Last directory the shell reported, or the one it started in
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn size(&self) -> TermSize {
        self.size
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Suggestions for what is currently typed
    pub fn suggestions(&self) -> Vec<String> {
        self.history.suggest(&self.input_buffer)
    }

    /// The shell has turned on bracketed paste
    pub fn bracketed_paste(&self) -> bool {
        self.scanner.bracketed_paste
    }

    /// Handle a chunk of shell output
    pub fn on_output_chunk(&mut self, data: &[u8]) {
        if self.state == SessionState::Spawning {
            debug!(session_id = self.id, "first output, session running");
            self.state = SessionState::Running;
        }
        self.recent_output = true;
        self.widget.write(data);

        if let Some(path) = self.scanner.feed(data) {
            if path != self.cwd {
                debug!(session_id = self.id, path = %path.display(), "directory changed");
                self.cwd = path.clone();
                self.bus.emit(&Event::DirectoryChanged {
                    session_id: self.id,
                    path,
                });
            }
        }
    }

    /// The PTY has no more output to give
    pub fn on_output_closed(&mut self) {
        self.output_closed = true;
    }

    pub fn output_closed(&self) -> bool {
        self.output_closed
    }

    /// Handle keystrokes or pasted text from the widget
    pub fn on_user_input(&mut self, data: &[u8]) -> pty::Result<()> {
        if self.is_exited() || data.is_empty() {
            return Ok(());
        }

        match classify(data) {
            Input::Enter => {
                self.submit_line();
                self.handle.write(data)
            }
            Input::Interrupt => {
                self.input_buffer.clear();
                self.history.reset_navigation();
                self.handle.signal(Signal::Interrupt).map(|_| ())
            }
            Input::EndOfFile => {
                if self.input_buffer.is_empty() {
                    self.handle.write(data)
                } else {
                    Ok(())
                }
            }
            Input::Suspend => {
                if !self.handle.signal(Signal::Suspend)? {
                    debug!(session_id = self.id, "suspend not supported here");
                }
                Ok(())
            }
            Input::ClearScreen => {
                self.widget.write(CLEAR_SCREEN);
                self.handle.write(data)
            }
            Input::Erase => {
                self.input_buffer.pop();
                self.handle.write(data)
            }
            Input::KillLine => {
                self.input_buffer.clear();
                self.handle.write(data)
            }
            Input::Text(text) => {
                self.take_text(text);
                self.handle.write(data)
            }
            Input::Raw => self.handle.write(data),
        }
    }

    /// Send pasted text
    ///
    /// With bracketed paste on, the text is wrapped so the shell inserts it
    /// as a whole; its line breaks then stay in the command line instead of
    /// submitting it.
    pub fn paste(&mut self, text: &str) -> pty::Result<()> {
        if !self.bracketed_paste() {
            return self.on_user_input(text.as_bytes());
        }
        if self.is_exited() || text.is_empty() {
            return Ok(());
        }

        let mut bytes = Vec::with_capacity(PASTE_START.len() + text.len() + PASTE_END.len());
        bytes.extend_from_slice(PASTE_START);
        bytes.extend_from_slice(text.as_bytes());
        bytes.extend_from_slice(PASTE_END);
        self.handle.write(&bytes)?;

        let text = text.replace("\r\n", "\n").replace('\r', "\n");
        self.input_buffer.push_str(&text);
        Ok(())
    }

    /// Replace the typed line with the next history entry in `direction`
    ///
    /// Returns `false` when there is nothing further to recall.
    pub fn recall(&mut self, direction: Direction) -> pty::Result<bool> {
        if self.is_exited() {
            return Ok(false);
        }
        let Some(text) = self.history.navigate(direction, &self.input_buffer) else {
            return Ok(false);
        };

        let mut bytes = vec![ERASE; self.input_buffer.chars().count()];
        bytes.extend_from_slice(text.as_bytes());
        self.handle.write(&bytes)?;
        self.input_buffer = text;
        Ok(true)
    }

    pub fn resize(&mut self, size: TermSize) -> pty::Result<()> {
        if size == self.size {
            return Ok(());
        }
        self.size = size;
        self.widget.resize(size);
        self.handle.resize(size)
    }

    /// Check whether the shell has gone away
    ///
    /// Exit is acted on once the output stream has reached EOF. Without EOF
    /// the shell must stay quiet for several polls in a row, so the exit
    /// marker lands after the shell's final output.
    pub fn poll_exit(&mut self) -> Option<ExitInfo> {
        if self.is_exited() {
            return None;
        }
        if !self.output_closed {
            if std::mem::take(&mut self.recent_output) {
                self.quiet_polls = 0;
                return None;
            }
            self.quiet_polls = self.quiet_polls.saturating_add(1);
            if self.quiet_polls < QUIET_POLLS_BEFORE_EXIT {
                return None;
            }
        }

        match self.handle.poll_exit() {
            Ok(Some(exit)) => {
                self.mark_exited(exit.clone());
                Some(exit)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(session_id = self.id, error = %e, "failed to poll shell");
                None
            }
        }
    }

    /// Stop the shell: hangup, then kill once `grace` runs out
    pub fn terminate(&mut self, grace: Duration) -> pty::Result<ExitInfo> {
        if let SessionState::Exited(exit) = &self.state {
            return Ok(exit.clone());
        }
        let exit = self.handle.terminate(grace)?;
        self.state = SessionState::Exited(exit.clone());
        Ok(exit)
    }

    fn mark_exited(&mut self, exit: ExitInfo) {
        info!(
            session_id = self.id,
            code = ?exit.code,
            signal = ?exit.signal,
            "shell exited"
        );
        self.widget.write(EXIT_MARKER);
        self.input_buffer.clear();
        self.state = SessionState::Exited(exit.clone());
        self.bus.emit(&Event::ProcessExited {
            session_id: self.id,
            exit,
        });
    }

    /// Track typed or pasted text, submitting at each line break
    fn take_text(&mut self, text: &str) {
        let mut after_cr = false;
        for c in text.chars() {
            match c {
                '\n' if after_cr => {}
                '\r' | '\n' => self.submit_line(),
                _ => self.input_buffer.push(c),
            }
            after_cr = c == '\r';
        }
    }

    fn submit_line(&mut self) {
        let command = self.input_buffer.trim().to_string();
        self.input_buffer.clear();
        self.history.reset_navigation();
        if command.is_empty() {
            return;
        }

        self.history.append(&command);
        self.bus.emit(&Event::CommandExecuted {
            session_id: self.id,
            command,
        });
    }
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("cwd", &self.cwd)
            .field("input_buffer", &self.input_buffer)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    #[default]
    Ground,
    Escape,
    Csi,
    Osc,
    OscEscape,
}

/// Watches output for the few sequences the session acts on: `OSC 7 ;
/// file://host/path` directory reports and DEC private mode 2004.
#[derive(Debug, Default)]
struct OutputScanner {
    state: ScanState,
    pending: Vec<u8>,
    bracketed_paste: bool,
}

impl OutputScanner {
    /// Feed output; returns the last directory completed in this chunk
    fn feed(&mut self, data: &[u8]) -> Option<PathBuf> {
        let mut found = None;
        for &b in data {
            self.state = match (self.state, b) {
                (ScanState::Ground, 0x1b) => ScanState::Escape,
                (ScanState::Ground, _) => ScanState::Ground,
                (ScanState::Escape, b']') => {
                    self.pending.clear();
                    ScanState::Osc
                }
                (ScanState::Escape, b'[') => {
                    self.pending.clear();
                    ScanState::Csi
                }
                (ScanState::Escape, 0x1b) => ScanState::Escape,
                (ScanState::Escape, _) => ScanState::Ground,
                (ScanState::Csi, 0x1b) => ScanState::Escape,
                (ScanState::Csi, 0x40..=0x7e) => {
                    self.finish_csi(b);
                    ScanState::Ground
                }
                (ScanState::Csi, 0x20..=0x3f) if self.pending.len() < MAX_CSI_LEN => {
                    self.pending.push(b);
                    ScanState::Csi
                }
                // Controls inside CSI are executed, not part of it
                (ScanState::Csi, 0x00..=0x1f) => ScanState::Csi,
                (ScanState::Csi, _) => ScanState::Ground,
                (ScanState::Osc, 0x07) => {
                    found = self.finish_osc().or(found);
                    ScanState::Ground
                }
                (ScanState::Osc, 0x1b) => ScanState::OscEscape,
                (ScanState::Osc, _) if self.pending.len() < MAX_OSC_LEN => {
                    self.pending.push(b);
                    ScanState::Osc
                }
                (ScanState::Osc, _) => ScanState::Ground,
                (ScanState::OscEscape, b'\\') => {
                    found = self.finish_osc().or(found);
                    ScanState::Ground
                }
                // ESC inside an OSC aborts it and may start a new sequence
                (ScanState::OscEscape, b']') => {
                    self.pending.clear();
                    ScanState::Osc
                }
                (ScanState::OscEscape, b'[') => {
                    self.pending.clear();
                    ScanState::Csi
                }
                (ScanState::OscEscape, _) => ScanState::Ground,
            };
        }
        found
    }

    fn finish_osc(&mut self) -> Option<PathBuf> {
        let payload = std::mem::take(&mut self.pending);
        let url = std::str::from_utf8(payload.strip_prefix(b"7;")?).ok()?;
        parse_file_url(url)
    }

    /// `CSI ? Pm h` sets private modes, `CSI ? Pm l` resets them
    fn finish_csi(&mut self, final_byte: u8) {
        let params = std::mem::take(&mut self.pending);
        let enable = match final_byte {
            b'h' => true,
            b'l' => false,
            _ => return,
        };
        let Some(modes) = params.strip_prefix(b"?") else {
            return;
        };
        if modes.split(|&b| b == b';').any(|mode| mode == b"2004") {
            self.bracketed_paste = enable;
        }
    }
}

/// `file://host/some%20dir` -> `/some dir`
fn parse_file_url(url: &str) -> Option<PathBuf> {
    let rest = url.strip_prefix("file://")?;
    let path = &rest[rest.find('/')?..];
    percent_decode(path).map(PathBuf::from)
}

fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = std::str::from_utf8(bytes.get(i + 1..i + 3)?).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
