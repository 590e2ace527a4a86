//! In-process stand-ins for shells and widgets used by unit tests

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use super::pty::{
    ExitInfo, ProcessEvent, ProcessEventSender, ProcessSpawner, PtyError, Result, ShellProcess,
    Signal, SpawnRequest, SpawnedProcess, TermSize,
};
use super::session::TerminalWidget;
use super::SessionId;

/// Everything a fake shell was asked to do
#[derive(Debug, Default)]
pub struct ProcessLog {
    pub request: Option<SpawnRequest>,
    pub writes: Vec<u8>,
    pub signals: Vec<Signal>,
    pub resizes: Vec<TermSize>,
    pub exit: Option<ExitInfo>,
}

#[derive(Default)]
struct SpawnerState {
    fail_spawns: bool,
    ignore_hangup: bool,
    spawn_count: usize,
    processes: HashMap<SessionId, Rc<RefCell<ProcessLog>>>,
    senders: HashMap<SessionId, ProcessEventSender>,
}

/// Spawner whose shells only record what they receive
#[derive(Clone, Default)]
pub struct FakeSpawner {
    state: Rc<RefCell<SpawnerState>>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_spawns(&self, fail: bool) {
        self.state.borrow_mut().fail_spawns = fail;
    }

    pub fn ignore_hangup(&self, ignore: bool) {
        self.state.borrow_mut().ignore_hangup = ignore;
    }

    pub fn spawn_count(&self) -> usize {
        self.state.borrow().spawn_count
    }

    pub fn process(&self, session_id: SessionId) -> Rc<RefCell<ProcessLog>> {
        Rc::clone(&self.state.borrow().processes[&session_id])
    }

    /// Pretend the shell printed `data`
    pub fn emit_output(&self, session_id: SessionId, data: &[u8]) {
        let state = self.state.borrow();
        let _ = state.senders[&session_id].send(ProcessEvent::Output {
            session_id,
            data: data.to_vec(),
        });
    }

    /// Pretend the shell exited and its PTY closed
    pub fn exit(&self, session_id: SessionId, exit: ExitInfo) {
        let state = self.state.borrow();
        state.processes[&session_id].borrow_mut().exit = Some(exit);
        let _ = state.senders[&session_id].send(ProcessEvent::Eof { session_id });
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self, request: &SpawnRequest, events: ProcessEventSender) -> Result<SpawnedProcess> {
        let mut state = self.state.borrow_mut();
        if state.fail_spawns {
            return Err(PtyError::Spawn {
                shell: request.shell.clone(),
                source: "spawn refused".into(),
            });
        }
        state.spawn_count += 1;

        let log = Rc::new(RefCell::new(ProcessLog {
            request: Some(request.clone()),
            ..ProcessLog::default()
        }));
        state.processes.insert(request.session_id, Rc::clone(&log));
        state.senders.insert(request.session_id, events);

        Ok(SpawnedProcess {
            program: PathBuf::from(&request.shell),
            process: Box::new(FakeProcess {
                pid: 1000 + request.session_id as u32,
                ignore_hangup: state.ignore_hangup,
                log,
            }),
        })
    }
}

struct FakeProcess {
    pid: u32,
    ignore_hangup: bool,
    log: Rc<RefCell<ProcessLog>>,
}

impl ShellProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.log.borrow_mut().writes.extend_from_slice(data);
        Ok(())
    }

    fn resize(&mut self, size: TermSize) -> Result<()> {
        self.log.borrow_mut().resizes.push(size);
        Ok(())
    }

    fn signal(&mut self, signal: Signal) -> Result<bool> {
        let mut log = self.log.borrow_mut();
        if log.exit.is_some() {
            return Ok(false);
        }
        log.signals.push(signal);
        match signal {
            Signal::Hangup if !self.ignore_hangup => {
                log.exit = Some(ExitInfo::with_signal("SIGHUP"))
            }
            Signal::Terminate => log.exit = Some(ExitInfo::with_signal("SIGTERM")),
            Signal::Kill => log.exit = Some(ExitInfo::with_signal("SIGKILL")),
            _ => {}
        }
        Ok(true)
    }

    fn try_wait(&mut self) -> Result<Option<ExitInfo>> {
        Ok(self.log.borrow().exit.clone())
    }

    fn wait(&mut self) -> Result<ExitInfo> {
        self.log.borrow().exit.clone().ok_or_else(|| {
            PtyError::Wait(std::io::Error::new(
                std::io::ErrorKind::Other,
                "fake shell never exits",
            ))
        })
    }
}

/// Widget that keeps everything written to it
#[derive(Clone, Default)]
pub struct RecordingWidget {
    pub output: Rc<RefCell<Vec<u8>>>,
    pub sizes: Rc<RefCell<Vec<TermSize>>>,
}

impl RecordingWidget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output.borrow()).into_owned()
    }
}

impl TerminalWidget for RecordingWidget {
    fn write(&mut self, data: &[u8]) {
        self.output.borrow_mut().extend_from_slice(data);
    }

    fn resize(&mut self, size: TermSize) {
        self.sizes.borrow_mut().push(size);
    }
}
