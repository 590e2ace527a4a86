//! Shell processes on a pseudo terminal
//!
//! `ShellProcessHandle` owns one spawned shell: its PTY streams, pid and exit
//! status. Spawning goes through the `ProcessSpawner` trait so sessions never
//! touch the platform directly; `PtySpawner` is the real implementation.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtyPair, PtySize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::SessionId;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How often a terminating shell is polled for exit
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Size of a single PTY read
const READ_CHUNK: usize = 4096;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Shell not found: {shell}")]
    ShellNotFound {
        shell: String,
        #[source]
        source: which::Error,
    },

    #[error("Working directory does not exist: {}", .0.display())]
    InvalidWorkingDirectory(PathBuf),

    #[error("Failed to open pseudo terminal: {0}")]
    OpenPty(#[source] BoxError),

    #[error("Failed to spawn {shell}: {source}")]
    Spawn {
        shell: String,
        #[source]
        source: BoxError,
    },

    #[error("Failed to write to shell: {0}")]
    Write(#[source] io::Error),

    #[error("Failed to resize pseudo terminal: {0}")]
    Resize(#[source] BoxError),

    #[error("Failed to deliver {signal:?}: {source}")]
    Signal {
        signal: Signal,
        #[source]
        source: io::Error,
    },

    #[error("Failed to wait for shell: {0}")]
    Wait(#[source] io::Error),

    #[error("Shell has already exited")]
    Exited,
}

impl PtyError {
    /// True for failures that happen while launching a shell
    pub fn is_spawn_error(&self) -> bool {
        matches!(
            self,
            PtyError::ShellNotFound { .. }
                | PtyError::InvalidWorkingDirectory(_)
                | PtyError::OpenPty(_)
                | PtyError::Spawn { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// Terminal grid size in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl TermSize {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl From<TermSize> for PtySize {
    fn from(size: TermSize) -> Self {
        PtySize {
            rows: size.rows.max(1),
            cols: size.cols.max(1),
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Signals a session can deliver to its shell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Ctrl-C
    Interrupt,
    /// Ctrl-Z
    Suspend,
    /// The terminal went away
    Hangup,
    Terminate,
    Kill,
}

impl Signal {
    /// Interrupt and suspend are meant for the job in the foreground, not
    /// the shell itself.
    pub fn targets_foreground(self) -> bool {
        matches!(self, Signal::Interrupt | Signal::Suspend)
    }

    #[cfg(unix)]
    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Suspend => libc::SIGTSTP,
            Signal::Hangup => libc::SIGHUP,
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// How a shell ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<u32>,
    pub signal: Option<String>,
}

impl ExitInfo {
    pub fn with_code(code: u32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn with_signal(signal: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: Some(signal.into()),
        }
    }
}

impl From<portable_pty::ExitStatus> for ExitInfo {
    fn from(status: portable_pty::ExitStatus) -> Self {
        match status.signal() {
            Some(signal) => Self::with_signal(signal),
            None => Self::with_code(status.exit_code()),
        }
    }
}

/// Everything needed to launch one shell
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub session_id: SessionId,
    pub shell: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub size: TermSize,
}

/// Notifications from a shell's reader thread back to the event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Bytes the shell wrote, in the order the OS delivered them
    Output { session_id: SessionId, data: Vec<u8> },
    /// The PTY reached end of file; no more output will follow
    Eof { session_id: SessionId },
}

pub type ProcessEventSender = Sender<ProcessEvent>;

/// A running shell as the platform sees it
pub trait ShellProcess {
    fn pid(&self) -> Option<u32>;

    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    fn resize(&mut self, size: TermSize) -> Result<()>;

    /// Deliver a signal. Returns `false` when the platform has no equivalent
    /// or the target is already gone.
    fn signal(&mut self, signal: Signal) -> Result<bool>;

    fn try_wait(&mut self) -> Result<Option<ExitInfo>>;

    fn wait(&mut self) -> Result<ExitInfo>;
}

/// A freshly spawned shell plus the program path it resolved to
pub struct SpawnedProcess {
    pub program: PathBuf,
    pub process: Box<dyn ShellProcess>,
}

/// Launches shells. Output must be delivered through `events`.
pub trait ProcessSpawner {
    fn spawn(&self, request: &SpawnRequest, events: ProcessEventSender) -> Result<SpawnedProcess>;
}

/// Handle to one spawned shell
pub struct ShellProcessHandle {
    session_id: SessionId,
    pid: Option<u32>,
    shell_path: PathBuf,
    argv: Vec<String>,
    working_directory: PathBuf,
    exit: Option<ExitInfo>,
    process: Box<dyn ShellProcess>,
}

impl std::fmt::Debug for ShellProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellProcessHandle")
            .field("session_id", &self.session_id)
            .field("pid", &self.pid)
            .field("shell_path", &self.shell_path)
            .field("argv", &self.argv)
            .field("working_directory", &self.working_directory)
            .field("exit", &self.exit)
            .finish()
    }
}

impl ShellProcessHandle {
    /// Spawn a shell for `request`
    pub fn spawn(
        spawner: &dyn ProcessSpawner,
        request: &SpawnRequest,
        events: ProcessEventSender,
    ) -> Result<Self> {
        if !request.cwd.is_dir() {
            return Err(PtyError::InvalidWorkingDirectory(request.cwd.clone()));
        }

        let spawned = spawner.spawn(request, events)?;
        let pid = spawned.process.pid();
        info!(
            session_id = request.session_id,
            pid = ?pid,
            shell = %spawned.program.display(),
            cwd = %request.cwd.display(),
            "shell spawned"
        );

        Ok(Self {
            session_id: request.session_id,
            pid,
            shell_path: spawned.program,
            argv: request.args.clone(),
            working_directory: request.cwd.clone(),
            exit: None,
            process: spawned.process,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn shell_path(&self) -> &Path {
        &self.shell_path
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn exit_code(&self) -> Option<u32> {
        self.exit.as_ref().and_then(|e| e.code)
    }

    pub fn exit_signal(&self) -> Option<&str> {
        self.exit.as_ref().and_then(|e| e.signal.as_deref())
    }

    pub fn exit_info(&self) -> Option<&ExitInfo> {
        self.exit.as_ref()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.is_some()
    }

    /// Write bytes to the shell's stdin
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.has_exited() {
            return Err(PtyError::Exited);
        }
        self.process.write_all(data)
    }

    /// Resize the PTY; a no-op once the shell is gone
    pub fn resize(&mut self, size: TermSize) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        self.process.resize(size)
    }

    pub fn signal(&mut self, signal: Signal) -> Result<bool> {
        if self.has_exited() {
            return Ok(false);
        }
        let delivered = self.process.signal(signal)?;
        debug!(session_id = self.session_id, ?signal, delivered, "signal sent");
        Ok(delivered)
    }

    /// Non-blocking exit check; records the status the first time it is seen
    pub fn poll_exit(&mut self) -> Result<Option<ExitInfo>> {
        if let Some(exit) = &self.exit {
            return Ok(Some(exit.clone()));
        }
        match self.process.try_wait()? {
            Some(exit) => Ok(Some(self.record_exit(exit))),
            None => Ok(None),
        }
    }

    /// Hang up on the shell, give it `grace` to leave, then kill and reap it
    pub fn terminate(&mut self, grace: Duration) -> Result<ExitInfo> {
        if let Some(exit) = self.poll_exit()? {
            return Ok(exit);
        }

        self.process.signal(Signal::Hangup)?;
        let deadline = Instant::now() + grace;
        loop {
            if let Some(exit) = self.process.try_wait()? {
                debug!(session_id = self.session_id, "shell left after hangup");
                return Ok(self.record_exit(exit));
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(REAP_POLL_INTERVAL.min(deadline - now));
        }

        warn!(
            session_id = self.session_id,
            pid = ?self.pid,
            grace_ms = grace.as_millis() as u64,
            "shell ignored hangup, killing"
        );
        self.process.signal(Signal::Kill)?;
        let exit = self.process.wait()?;
        Ok(self.record_exit(exit))
    }

    fn record_exit(&mut self, exit: ExitInfo) -> ExitInfo {
        self.exit = Some(exit.clone());
        exit
    }
}

impl Drop for ShellProcessHandle {
    fn drop(&mut self) {
        if self.has_exited() {
            return;
        }
        if matches!(self.process.signal(Signal::Kill), Ok(true)) {
            let _ = self.process.wait();
        }
    }
}

/// Spawns shells on the platform's native PTY
#[derive(Debug, Default, Clone, Copy)]
pub struct PtySpawner;

impl ProcessSpawner for PtySpawner {
    fn spawn(&self, request: &SpawnRequest, events: ProcessEventSender) -> Result<SpawnedProcess> {
        let program = which::which(&request.shell).map_err(|source| PtyError::ShellNotFound {
            shell: request.shell.clone(),
            source,
        })?;

        let PtyPair { master, slave } = native_pty_system()
            .openpty(request.size.into())
            .map_err(|e| PtyError::OpenPty(e.into()))?;

        let mut cmd = CommandBuilder::new(&program);
        cmd.args(&request.args);
        cmd.cwd(&request.cwd);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let child = slave.spawn_command(cmd).map_err(|e| PtyError::Spawn {
            shell: request.shell.clone(),
            source: e.into(),
        })?;
        // The child holds its own copy; ours would keep the reader from
        // ever seeing EOF.
        drop(slave);

        let reader = master
            .try_clone_reader()
            .map_err(|e| PtyError::OpenPty(e.into()))?;
        let writer = master
            .take_writer()
            .map_err(|e| PtyError::OpenPty(e.into()))?;

        spawn_reader(request.session_id, reader, events)
            .map_err(|e| PtyError::OpenPty(e.into()))?;

        Ok(SpawnedProcess {
            program,
            process: Box::new(PtyProcess {
                master,
                writer,
                child,
            }),
        })
    }
}

/// Pump PTY output into the event channel until EOF
fn spawn_reader(
    session_id: SessionId,
    mut reader: Box<dyn Read + Send>,
    events: ProcessEventSender,
) -> io::Result<()> {
    thread::Builder::new()
        .name(format!("pty-reader-{session_id}"))
        .spawn(move || {
            let mut buffer = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        let event = ProcessEvent::Output {
                            session_id,
                            data: buffer[..n].to_vec(),
                        };
                        if events.send(event).is_err() {
                            // Registry is gone
                            return;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EIO on Linux once the slave side closes
                        debug!(session_id, error = %e, "pty read ended");
                        break;
                    }
                }
            }
            let _ = events.send(ProcessEvent::Eof { session_id });
        })
        .map(|_| ())
}

struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl ShellProcess for PtyProcess {
    fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data).map_err(PtyError::Write)?;
        self.writer.flush().map_err(PtyError::Write)
    }

    fn resize(&mut self, size: TermSize) -> Result<()> {
        self.master
            .resize(size.into())
            .map_err(|e| PtyError::Resize(e.into()))
    }

    #[cfg(unix)]
    fn signal(&mut self, signal: Signal) -> Result<bool> {
        let Some(pid) = self.child.process_id() else {
            return Ok(false);
        };
        let target = match self.master.process_group_leader() {
            Some(pgid) if signal.targets_foreground() && pgid > 0 => -pgid,
            _ => pid as libc::pid_t,
        };

        // SAFETY: kill(2) only takes integers; a stale target yields ESRCH.
        let rc = unsafe { libc::kill(target, signal.as_raw()) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(false)
        } else {
            Err(PtyError::Signal {
                signal,
                source: err,
            })
        }
    }

    #[cfg(not(unix))]
    fn signal(&mut self, signal: Signal) -> Result<bool> {
        use portable_pty::ChildKiller;

        match signal {
            // ConPTY turns ETX into a console control event
            Signal::Interrupt => {
                self.write_all(&[0x03])?;
                Ok(true)
            }
            Signal::Suspend => Ok(false),
            Signal::Hangup | Signal::Terminate | Signal::Kill => {
                self.child
                    .kill()
                    .map_err(|source| PtyError::Signal { signal, source })?;
                Ok(true)
            }
        }
    }

    fn try_wait(&mut self) -> Result<Option<ExitInfo>> {
        self.child
            .try_wait()
            .map(|status| status.map(ExitInfo::from))
            .map_err(PtyError::Wait)
    }

    fn wait(&mut self) -> Result<ExitInfo> {
        self.child.wait().map(ExitInfo::from).map_err(PtyError::Wait)
    }
}
