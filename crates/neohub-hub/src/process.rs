use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub bin: PathBuf,
    pub args: Vec<String>,
    pub wd: PathBuf,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub pid: u32,
    pub code: Option<i32>,
}

/// Invoked exactly once, from whatever context observes the exit.
pub type ExitCallback = Box<dyn FnOnce(ProcessExit) + Send + 'static>;

pub trait EditorProcess: Send + Sync + fmt::Debug {
    fn pid(&self) -> u32;
    fn is_running(&self) -> bool;
    fn exit_code(&self) -> Option<i32>;
    fn terminate(&self);
}

pub trait ProcessLauncher: Send + Sync {
    fn launch(
        &self,
        command: &LaunchCommand,
        on_exit: ExitCallback,
    ) -> io::Result<Box<dyn EditorProcess>>;
}

#[derive(Debug)]
struct ProcessState {
    pid: u32,
    running: AtomicBool,
    exit_code: Mutex<Option<i32>>,
}

impl ProcessState {
    fn mark_exited(&self, code: Option<i32>) {
        *self
            .exit_code
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = code;
        self.running.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct TokioProcess {
    state: Arc<ProcessState>,
}

impl EditorProcess for TokioProcess {
    fn pid(&self) -> u32 {
        self.state.pid
    }

    fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    fn exit_code(&self) -> Option<i32> {
        *self
            .state
            .exit_code
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn terminate(&self) {
        if !self.is_running() {
            return;
        }
        let Ok(pid) = libc::pid_t::try_from(self.state.pid) else {
            warn!(event = "editor_terminate_bad_pid", pid = self.state.pid);
            return;
        };
        debug!(event = "editor_terminate", pid);
        if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
            warn!(
                event = "editor_terminate_failed",
                pid,
                error = %io::Error::last_os_error()
            );
        }
    }
}

/// Spawns editors as tokio child processes. Must be called inside a runtime.
#[derive(Debug, Default)]
pub struct TokioLauncher;

impl ProcessLauncher for TokioLauncher {
    fn launch(
        &self,
        command: &LaunchCommand,
        on_exit: ExitCallback,
    ) -> io::Result<Box<dyn EditorProcess>> {
        let mut child = Command::new(&command.bin)
            .args(&command.args)
            .current_dir(&command.wd)
            .env_clear()
            .envs(&command.env)
            .stdin(Stdio::null())
            .spawn()?;

        let pid = child
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "spawned process has no pid"))?;
        let state = Arc::new(ProcessState {
            pid,
            running: AtomicBool::new(true),
            exit_code: Mutex::new(None),
        });

        if let Some(status) = child.try_wait()? {
            state.mark_exited(status.code());
            on_exit(ProcessExit {
                pid,
                code: status.code(),
            });
            return Ok(Box::new(TokioProcess { state }));
        }

        let watched = state.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!(event = "editor_wait_error", pid, error = %err);
                    None
                }
            };
            watched.mark_exited(code);
            on_exit(ProcessExit { pid, code });
        });

        Ok(Box::new(TokioProcess { state }))
    }
}
