use std::fs;
use std::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppHandle {
    pub pid: u32,
    pub name: Option<String>,
}

impl AppHandle {
    pub fn new(pid: u32) -> Self {
        Self { pid, name: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowRef(pub u64);

/// Which application holds OS foreground focus, and moving focus between them.
pub trait ForegroundApps: Send + Sync {
    fn frontmost(&self) -> Option<AppHandle>;
    fn app_for_pid(&self, pid: u32) -> Option<AppHandle>;
    fn activate(&self, app: &AppHandle) -> bool;
    fn hide(&self, app: &AppHandle) -> bool;
}

/// The hub's own windows. The switcher is the focus-stealing surface.
pub trait HubWindows: Send + Sync {
    fn main_window(&self) -> Option<WindowRef>;
    fn is_switcher(&self, window: WindowRef) -> bool;
    fn activate(&self, window: WindowRef);
}

#[derive(Debug, Default)]
pub struct HeadlessWindows;

impl HubWindows for HeadlessWindows {
    fn main_window(&self) -> Option<WindowRef> {
        None
    }

    fn is_switcher(&self, _window: WindowRef) -> bool {
        false
    }

    fn activate(&self, _window: WindowRef) {}
}

/// X11 foreground control through `xdotool`.
#[derive(Debug, Default)]
pub struct XdotoolDesktop;

impl XdotoolDesktop {
    fn run(args: &[&str]) -> Result<String, String> {
        let output = Command::new("xdotool")
            .args(args)
            .output()
            .map_err(|err| format!("spawn_error:{err}"))?;
        if !output.status.success() {
            return Err(format!("xdotool_exit:{}", output.status));
        }
        String::from_utf8(output.stdout).map_err(|err| format!("utf8:{err}"))
    }

    fn window_action(app: &AppHandle, action: &str) -> bool {
        let pid = app.pid.to_string();
        match Self::run(&["search", "--onlyvisible", "--pid", &pid, action]) {
            Ok(_) => true,
            Err(err) => {
                debug!(event = "xdotool_action_failed", pid = app.pid, action, error = %err);
                false
            }
        }
    }
}

impl ForegroundApps for XdotoolDesktop {
    fn frontmost(&self) -> Option<AppHandle> {
        match Self::run(&["getactivewindow", "getwindowpid"]) {
            Ok(stdout) => {
                let pid = stdout.trim().parse::<u32>().ok()?;
                self.app_for_pid(pid)
            }
            Err(err) => {
                debug!(event = "xdotool_frontmost_failed", error = %err);
                None
            }
        }
    }

    fn app_for_pid(&self, pid: u32) -> Option<AppHandle> {
        if !process_alive(pid) {
            return None;
        }
        let name = fs::read_to_string(format!("/proc/{pid}/comm"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        Some(AppHandle { pid, name })
    }

    fn activate(&self, app: &AppHandle) -> bool {
        Self::window_action(app, "windowactivate")
    }

    fn hide(&self, app: &AppHandle) -> bool {
        Self::window_action(app, "windowminimize")
    }
}

pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        warn!(event = "pid_out_of_range", pid);
        return false;
    };
    // Signal 0 only performs the existence and permission check.
    unsafe { libc::kill(pid, 0) == 0 }
}
