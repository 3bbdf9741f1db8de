use crate::desktop::{AppHandle, ForegroundApps, HubWindows, WindowRef};
use crate::process::{EditorProcess, ExitCallback, LaunchCommand, ProcessExit, ProcessLauncher};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct FakeDesktop {
    apps: Mutex<BTreeSet<u32>>,
    frontmost: Mutex<Option<u32>>,
    decline: AtomicBool,
    activated: Mutex<Vec<u32>>,
    hidden: Mutex<Vec<u32>>,
}

impl FakeDesktop {
    pub fn add_app(&self, pid: u32) {
        self.apps.lock().unwrap().insert(pid);
    }

    pub fn remove_app(&self, pid: u32) {
        self.apps.lock().unwrap().remove(&pid);
    }

    pub fn set_frontmost(&self, pid: Option<u32>) {
        *self.frontmost.lock().unwrap() = pid;
    }

    pub fn decline_activation(&self, decline: bool) {
        self.decline.store(decline, Ordering::SeqCst);
    }

    pub fn activated(&self) -> Vec<u32> {
        self.activated.lock().unwrap().clone()
    }

    pub fn hidden(&self) -> Vec<u32> {
        self.hidden.lock().unwrap().clone()
    }
}

impl ForegroundApps for FakeDesktop {
    fn frontmost(&self) -> Option<AppHandle> {
        self.frontmost.lock().unwrap().map(AppHandle::new)
    }

    fn app_for_pid(&self, pid: u32) -> Option<AppHandle> {
        self.apps
            .lock()
            .unwrap()
            .contains(&pid)
            .then(|| AppHandle::new(pid))
    }

    fn activate(&self, app: &AppHandle) -> bool {
        self.activated.lock().unwrap().push(app.pid);
        if self.decline.load(Ordering::SeqCst) {
            return false;
        }
        self.set_frontmost(Some(app.pid));
        true
    }

    fn hide(&self, app: &AppHandle) -> bool {
        self.hidden.lock().unwrap().push(app.pid);
        let mut frontmost = self.frontmost.lock().unwrap();
        if *frontmost == Some(app.pid) {
            *frontmost = None;
        }
        true
    }
}

#[derive(Default)]
pub struct FakeWindows {
    main: Option<WindowRef>,
    switcher: Option<WindowRef>,
    activated: Mutex<Vec<WindowRef>>,
}

impl FakeWindows {
    pub fn with_main(main: WindowRef, switcher: WindowRef) -> Self {
        Self {
            main: Some(main),
            switcher: Some(switcher),
            activated: Mutex::new(Vec::new()),
        }
    }

    pub fn activated(&self) -> Vec<WindowRef> {
        self.activated.lock().unwrap().clone()
    }
}

impl HubWindows for FakeWindows {
    fn main_window(&self) -> Option<WindowRef> {
        self.main
    }

    fn is_switcher(&self, window: WindowRef) -> bool {
        self.switcher == Some(window)
    }

    fn activate(&self, window: WindowRef) {
        self.activated.lock().unwrap().push(window);
    }
}

#[derive(Default)]
struct LauncherState {
    next_pid: AtomicU32,
    launched: Mutex<Vec<LaunchCommand>>,
    callbacks: Mutex<HashMap<u32, ExitCallback>>,
    running: Mutex<BTreeSet<u32>>,
    terminated: Mutex<Vec<u32>>,
    fail_spawn: AtomicBool,
    dead_on_arrival: AtomicBool,
    ignore_terminate: AtomicBool,
}

impl LauncherState {
    /// Delivers the exit from a separate thread, the way OS notifications arrive.
    fn exit(self: &Arc<Self>, pid: u32) -> bool {
        let callback = self.callbacks.lock().unwrap().remove(&pid);
        let Some(callback) = callback else {
            return false;
        };
        self.running.lock().unwrap().remove(&pid);
        std::thread::spawn(move || callback(ProcessExit { pid, code: Some(0) }))
            .join()
            .unwrap();
        true
    }
}

/// Scripted launcher. Pids start at 1000 and increase per launch.
#[derive(Clone, Default)]
pub struct FakeLauncher {
    state: Arc<LauncherState>,
}

impl FakeLauncher {
    pub fn launched(&self) -> Vec<LaunchCommand> {
        self.state.launched.lock().unwrap().clone()
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.state.terminated.lock().unwrap().clone()
    }

    pub fn fail_spawn(&self, fail: bool) {
        self.state.fail_spawn.store(fail, Ordering::SeqCst);
    }

    pub fn dead_on_arrival(&self, dead: bool) {
        self.state.dead_on_arrival.store(dead, Ordering::SeqCst);
    }

    pub fn ignore_terminate(&self, ignore: bool) {
        self.state.ignore_terminate.store(ignore, Ordering::SeqCst);
    }

    pub fn exit(&self, pid: u32) -> bool {
        self.state.exit(pid)
    }

    pub fn pid_of_launch(&self, index: usize) -> u32 {
        1000 + index as u32
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(
        &self,
        command: &LaunchCommand,
        on_exit: ExitCallback,
    ) -> io::Result<Box<dyn EditorProcess>> {
        if self.state.fail_spawn.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such binary"));
        }
        let pid = 1000 + self.state.next_pid.fetch_add(1, Ordering::SeqCst);
        self.state.launched.lock().unwrap().push(command.clone());

        if self.state.dead_on_arrival.load(Ordering::SeqCst) {
            on_exit(ProcessExit { pid, code: Some(1) });
            return Ok(Box::new(FakeProcess {
                pid,
                state: self.state.clone(),
            }));
        }

        self.state.running.lock().unwrap().insert(pid);
        self.state.callbacks.lock().unwrap().insert(pid, on_exit);
        Ok(Box::new(FakeProcess {
            pid,
            state: self.state.clone(),
        }))
    }
}

pub struct FakeProcess {
    pid: u32,
    state: Arc<LauncherState>,
}

impl std::fmt::Debug for FakeProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeProcess").field("pid", &self.pid).finish()
    }
}

impl EditorProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_running(&self) -> bool {
        self.state.running.lock().unwrap().contains(&self.pid)
    }

    fn exit_code(&self) -> Option<i32> {
        (!self.is_running()).then_some(1)
    }

    fn terminate(&self) {
        self.state.terminated.lock().unwrap().push(self.pid);
        if !self.state.ignore_terminate.load(Ordering::SeqCst) {
            self.state.exit(self.pid);
        }
    }
}
