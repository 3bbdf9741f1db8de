use crate::activation::{ActivationTarget, ActivationTracker};
use crate::desktop::{AppHandle, ForegroundApps};
use crate::error::{ActivationFailureReason, HubError};
use crate::process::{EditorProcess, ExitCallback, LaunchCommand, ProcessExit, ProcessLauncher};
use crate::report::{ReportableError, Reporter};
use chrono::{DateTime, Utc};
use neohub_core::RunRequest;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

pub const DEFAULT_NO_FORK_FLAG: &str = "--no-fork";

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub no_fork_flag: String,
    pub restart_timeout: Duration,
    pub restart_poll_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            no_fork_flag: DEFAULT_NO_FORK_FLAG.to_string(),
            restart_timeout: Duration::from_secs(5),
            restart_poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EditorId(PathBuf);

impl EditorId {
    pub fn for_request(request: &RunRequest) -> Self {
        match request.path.as_deref() {
            None | Some("") => Self::from_path(request.working_dir()),
            Some(path) => Self::from_path(&request.working_dir().join(path)),
        }
    }

    /// Canonical form of `path`. For paths that don't exist yet the deepest
    /// existing ancestor is canonicalized and the rest is appended, so the id
    /// stays stable once the file gets created.
    pub fn from_path(path: &Path) -> Self {
        Self(resolve_path(path))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn last_path_component(&self) -> String {
        self.0
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.0.display().to_string())
    }
}

impl fmt::Display for EditorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

fn resolve_path(path: &Path) -> PathBuf {
    let mut missing = Vec::new();
    let mut current = path;
    loop {
        if let Ok(canonical) = fs::canonicalize(current) {
            let mut resolved = canonical;
            for component in missing.iter().rev() {
                resolved.push(component);
            }
            return normalize_lexically(&resolved);
        }
        let (Some(parent), Some(last)) = (current.parent(), current.components().next_back())
        else {
            return normalize_lexically(path);
        };
        missing.push(last.as_os_str());
        current = parent;
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

pub fn display_path(path: &Path) -> String {
    static HOME_PREFIX: OnceLock<Option<Regex>> = OnceLock::new();
    let full = path.display().to_string();
    match HOME_PREFIX.get_or_init(|| Regex::new(r"^/(?:Users|home)/[^/]+/").ok()) {
        Some(regex) => regex.replace(&full, "~/").into_owned(),
        None => full,
    }
}

struct Editor {
    id: EditorId,
    name: String,
    process: Box<dyn EditorProcess>,
    last_access: DateTime<Utc>,
    request: RunRequest,
}

impl Editor {
    fn pid(&self) -> u32 {
        self.process.pid()
    }

    fn snapshot(&self) -> EditorSnapshot {
        EditorSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            pid: self.pid(),
            last_access: self.last_access,
            display_path: display_path(self.id.path()),
        }
    }
}

/// Read-only copy of a registered editor, safe to hand to UI code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorSnapshot {
    pub id: EditorId,
    pub name: String,
    pub pid: u32,
    pub last_access: DateTime<Utc>,
    pub display_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortTarget {
    Menubar,
    Switcher,
    LastActiveEditor,
}

/// `previous_editor_pid` is the tracker's editor target, if any.
pub fn sort_editors(
    mut editors: Vec<EditorSnapshot>,
    target: SortTarget,
    previous_editor_pid: Option<u32>,
) -> Vec<EditorSnapshot> {
    match target {
        SortTarget::Menubar => {
            editors.sort_by(|a, b| b.name.cmp(&a.name).then_with(|| a.id.cmp(&b.id)));
        }
        SortTarget::Switcher | SortTarget::LastActiveEditor => {
            editors.sort_by(|a, b| {
                b.last_access
                    .cmp(&a.last_access)
                    .then_with(|| a.id.cmp(&b.id))
            });
            if target == SortTarget::LastActiveEditor {
                editors.truncate(1);
            } else if editors.len() > 1 && previous_editor_pid == Some(editors[0].pid) {
                // One confirm flips between the two most recent editors.
                editors.swap(0, 1);
            }
        }
    }
    editors
}

/// Switcher search. Names match case-sensitively, display paths case-insensitively.
pub fn filter_editors(editors: Vec<EditorSnapshot>, query: &str) -> Vec<EditorSnapshot> {
    if query.is_empty() {
        return editors;
    }
    let folded = query.to_lowercase();
    editors
        .into_iter()
        .filter(|editor| {
            editor.name.contains(query) || editor.display_path.to_lowercase().contains(&folded)
        })
        .collect()
}

pub fn launch_command(request: &RunRequest, no_fork_flag: &str) -> LaunchCommand {
    let mut seen_flag = false;
    let mut args = request
        .opts
        .iter()
        .filter(|opt| {
            if opt.as_str() != no_fork_flag {
                return true;
            }
            let first = !seen_flag;
            seen_flag = true;
            first
        })
        .cloned()
        .collect::<Vec<_>>();
    if !seen_flag {
        args.push(no_fork_flag.to_string());
    }
    if let Some(path) = request.path.as_deref().filter(|path| !path.is_empty()) {
        args.push(path.to_string());
    }

    LaunchCommand {
        bin: request.bin.clone(),
        args,
        wd: request.wd.clone(),
        env: request.env.clone(),
    }
}

/// Desktop collaborators shell out and block, so they run on the blocking pool.
async fn on_desktop<T, F>(call: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::task::spawn_blocking(call).await {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(event = "desktop_call_failed", error = %err);
            None
        }
    }
}

async fn frontmost_app(foreground: &Arc<dyn ForegroundApps>) -> Option<AppHandle> {
    let foreground = foreground.clone();
    on_desktop(move || foreground.frontmost()).await.flatten()
}

fn report_failure(reporter: &dyn Reporter, error: &HubError, report: ReportableError) {
    error!(event = "hub_operation_failed", kind = error.report_kind().id(), error = %error);
    reporter.report(error.report_kind(), &report.with_source(error));
}

enum RegistryCommand {
    Run(RunRequest),
    Exited(EditorId, ProcessExit),
    Activate {
        id: EditorId,
        reply: oneshot::Sender<bool>,
    },
    Touch {
        pid: u32,
    },
    Terminate {
        id: EditorId,
        reply: oneshot::Sender<bool>,
    },
    QuitAll {
        reply: oneshot::Sender<usize>,
    },
    Editors {
        target: SortTarget,
        reply: oneshot::Sender<Vec<EditorSnapshot>>,
    },
    Contains {
        id: EditorId,
        reply: oneshot::Sender<bool>,
    },
    EditorForPid {
        pid: u32,
        reply: oneshot::Sender<Option<(EditorId, RunRequest)>>,
    },
}

/// Single writer for the editor map. Every mutation, including process exits
/// delivered from foreign threads, is funneled through its command channel.
struct RegistryActor {
    editors: HashMap<EditorId, Editor>,
    config: RegistryConfig,
    launcher: Arc<dyn ProcessLauncher>,
    foreground: Arc<dyn ForegroundApps>,
    tracker: Arc<ActivationTracker>,
    reporter: Arc<dyn Reporter>,
    sender: mpsc::WeakUnboundedSender<RegistryCommand>,
}

impl RegistryActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RegistryCommand>) {
        info!(event = "registry_start");
        while let Some(command) = rx.recv().await {
            self.handle(command).await;
        }
        info!(event = "registry_stop", editors = self.editors.len());
    }

    async fn handle(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Run(request) => self.run_editor(request).await,
            RegistryCommand::Exited(id, exit) => self.remove_exited(id, exit),
            RegistryCommand::Activate { id, reply } => {
                let _ = reply.send(self.activate(&id).await);
            }
            RegistryCommand::Touch { pid } => {
                if let Some(editor) = self.editors.values_mut().find(|e| e.pid() == pid) {
                    editor.last_access = Utc::now();
                }
            }
            RegistryCommand::Terminate { id, reply } => {
                let found = match self.editors.get(&id) {
                    Some(editor) => {
                        info!(event = "editor_quit", id = %id, pid = editor.pid());
                        editor.process.terminate();
                        true
                    }
                    None => false,
                };
                let _ = reply.send(found);
            }
            RegistryCommand::QuitAll { reply } => {
                info!(event = "editor_quit_all", count = self.editors.len());
                // Only signals go out here; removals arrive later as exit events.
                for editor in self.editors.values() {
                    editor.process.terminate();
                }
                let _ = reply.send(self.editors.len());
            }
            RegistryCommand::Editors { target, reply } => {
                let _ = reply.send(self.sorted(target));
            }
            RegistryCommand::Contains { id, reply } => {
                let _ = reply.send(self.editors.contains_key(&id));
            }
            RegistryCommand::EditorForPid { pid, reply } => {
                let found = self
                    .editors
                    .values()
                    .find(|editor| editor.pid() == pid)
                    .map(|editor| (editor.id.clone(), editor.request.clone()));
                let _ = reply.send(found);
            }
        }
    }

    fn snapshots(&self) -> Vec<EditorSnapshot> {
        self.editors.values().map(Editor::snapshot).collect()
    }

    fn sorted(&self, target: SortTarget) -> Vec<EditorSnapshot> {
        sort_editors(self.snapshots(), target, self.tracker.editor_target_pid())
    }

    async fn run_editor(&mut self, request: RunRequest) {
        let id = EditorId::for_request(&request);
        let name = request
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| id.last_path_component());
        info!(event = "editor_run", id = %id, name = %name);

        if self.editors.contains_key(&id) {
            info!(event = "editor_already_running", id = %id);
            self.activate(&id).await;
            return;
        }

        // Spawning can steal focus, so the foreground has to be captured first.
        let previous_app = frontmost_app(&self.foreground).await;
        let command = launch_command(&request, &self.config.no_fork_flag);
        debug!(
            event = "editor_launch",
            id = %id,
            bin = %command.bin.display(),
            wd = %command.wd.display(),
            args = ?command.args
        );

        let Some(sender) = self.sender.upgrade() else {
            warn!(event = "registry_closed", id = %id);
            return;
        };
        let exit_id = id.clone();
        let on_exit: ExitCallback = Box::new(move |exit| {
            let _ = sender.send(RegistryCommand::Exited(exit_id, exit));
        });

        let failure_report = |message: &str| {
            ReportableError::new(message, "registry::run_editor")
                .with_meta("EditorID", &id)
                .with_meta("EditorWorkingDirectory", request.wd.display())
                .with_meta("EditorBinary", request.bin.display())
                .with_meta("EditorPathArgument", request.path.as_deref().unwrap_or("-"))
                .with_meta("EditorOptions", format!("{:?}", request.opts))
        };

        let process = match self.launcher.launch(&command, on_exit) {
            Ok(process) => process,
            Err(err) => {
                let error = HubError::ProcessLaunchFailure(err.to_string());
                report_failure(
                    self.reporter.as_ref(),
                    &error,
                    failure_report("Failed to run editor process"),
                );
                return;
            }
        };

        if !process.is_running() {
            let error = HubError::ProcessLaunchFailure(format!(
                "editor process {} exited right after launch",
                process.pid()
            ));
            let mut report =
                failure_report("Editor process is not running").with_meta("EditorPID", process.pid());
            if let Some(code) = process.exit_code() {
                report = report.with_code(code);
            }
            report_failure(self.reporter.as_ref(), &error, report);
            return;
        }

        let snapshots = self.snapshots();
        self.tracker.set_activation_target(previous_app, &snapshots);

        info!(event = "editor_launched", id = %id, pid = process.pid());
        self.editors.insert(
            id.clone(),
            Editor {
                id,
                name,
                process,
                last_access: Utc::now(),
                request,
            },
        );
    }

    async fn activate(&mut self, id: &EditorId) -> bool {
        let Some(pid) = self.editors.get(id).map(Editor::pid) else {
            return false;
        };

        let foreground = self.foreground.clone();
        let outcome = on_desktop(move || match foreground.app_for_pid(pid) {
            None => Err(ActivationFailureReason::NotRunning),
            Some(app) if !foreground.activate(&app) => Err(ActivationFailureReason::Declined),
            Some(_) => Ok(()),
        })
        .await
        .unwrap_or(Err(ActivationFailureReason::NotRunning));

        let result = outcome.map_err(|reason| HubError::ActivationFailure {
            target: id.to_string(),
            reason,
        });

        match result {
            Ok(()) => {
                if let Some(editor) = self.editors.get_mut(id) {
                    editor.last_access = Utc::now();
                }
                trace!(event = "editor_activated", id = %id, pid);
                true
            }
            Err(error) => {
                let report = ReportableError::new("Failed to activate editor", "registry::activate")
                    .with_meta("EditorID", id)
                    .with_meta("EditorPID", pid);
                report_failure(self.reporter.as_ref(), &error, report);
                false
            }
        }
    }

    fn remove_exited(&mut self, id: EditorId, exit: ProcessExit) {
        match self.editors.get(&id) {
            Some(editor) if editor.pid() == exit.pid => {
                self.editors.remove(&id);
                info!(
                    event = "editor_removed",
                    id = %id,
                    pid = exit.pid,
                    code = exit.code.unwrap_or(-1),
                    remaining = self.editors.len()
                );
            }
            Some(editor) => {
                debug!(
                    event = "editor_exit_stale",
                    id = %id,
                    exited_pid = exit.pid,
                    current_pid = editor.pid()
                );
            }
            None => {
                debug!(event = "editor_exit_unregistered", id = %id, pid = exit.pid);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// Nothing to toggle directly; the caller should show the switcher.
    ShowSwitcher,
    Activated(EditorId),
    Hidden(EditorId),
    Restored,
}

/// Cloneable handle to the registry actor.
#[derive(Clone)]
pub struct EditorRegistry {
    tx: mpsc::UnboundedSender<RegistryCommand>,
    config: RegistryConfig,
    foreground: Arc<dyn ForegroundApps>,
    tracker: Arc<ActivationTracker>,
    reporter: Arc<dyn Reporter>,
}

impl EditorRegistry {
    /// Starts the registry actor on the current tokio runtime.
    pub fn spawn(
        config: RegistryConfig,
        launcher: Arc<dyn ProcessLauncher>,
        foreground: Arc<dyn ForegroundApps>,
        tracker: Arc<ActivationTracker>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = RegistryActor {
            editors: HashMap::new(),
            config: config.clone(),
            launcher,
            foreground: foreground.clone(),
            tracker: tracker.clone(),
            reporter: reporter.clone(),
            sender: tx.downgrade(),
        };
        tokio::spawn(actor.run(rx));
        Self {
            tx,
            config,
            foreground,
            tracker,
            reporter,
        }
    }

    pub fn tracker(&self) -> &Arc<ActivationTracker> {
        &self.tracker
    }

    fn send(&self, command: RegistryCommand) -> bool {
        if self.tx.send(command).is_err() {
            warn!(event = "registry_unavailable");
            return false;
        }
        true
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        if !self.send(build(reply)) {
            return None;
        }
        rx.await.ok()
    }

    /// Fire-and-forget: launches a new editor or focuses the one already open.
    pub fn run_editor(&self, request: RunRequest) {
        self.send(RegistryCommand::Run(request));
    }

    pub async fn editors(&self, target: SortTarget) -> Vec<EditorSnapshot> {
        self.request(|reply| RegistryCommand::Editors { target, reply })
            .await
            .unwrap_or_default()
    }

    /// Switcher rows for the current search text, in switcher order.
    pub async fn switcher_editors(&self, query: &str) -> Vec<EditorSnapshot> {
        filter_editors(self.editors(SortTarget::Switcher).await, query)
    }

    pub async fn len(&self) -> usize {
        self.editors(SortTarget::Menubar).await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, id: &EditorId) -> bool {
        let id = id.clone();
        self.request(|reply| RegistryCommand::Contains { id, reply })
            .await
            .unwrap_or(false)
    }

    /// Switcher selection.
    pub async fn activate_editor(&self, id: &EditorId) -> bool {
        let id = id.clone();
        self.request(|reply| RegistryCommand::Activate { id, reply })
            .await
            .unwrap_or(false)
    }

    /// Requests termination; the entry goes away once the exit is observed.
    pub async fn quit_editor(&self, id: &EditorId) -> bool {
        let id = id.clone();
        self.request(|reply| RegistryCommand::Terminate { id, reply })
            .await
            .unwrap_or(false)
    }

    /// Returns once every termination request is issued, not once they exit.
    pub async fn quit_all_editors(&self) -> usize {
        self.request(|reply| RegistryCommand::QuitAll { reply })
            .await
            .unwrap_or(0)
    }

    /// Restarts the editor that currently holds the foreground, if any.
    pub async fn restart_active_editor(&self) -> Result<Option<EditorId>, HubError> {
        let Some(app) = frontmost_app(&self.foreground).await else {
            debug!(event = "editor_restart_skipped", reason = "no_frontmost_app");
            return Ok(None);
        };
        let pid = app.pid;
        let Some((id, request)) = self
            .request(|reply| RegistryCommand::EditorForPid { pid, reply })
            .await
            .flatten()
        else {
            debug!(event = "editor_restart_skipped", reason = "not_an_editor", pid);
            return Ok(None);
        };

        info!(event = "editor_restart", id = %id, pid);
        self.quit_editor(&id).await;

        let started = Instant::now();
        while self.contains(&id).await {
            if started.elapsed() >= self.config.restart_timeout {
                let error = HubError::RestartTimeout {
                    id: id.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                };
                let report =
                    ReportableError::new("Failed to restart editor", "registry::restart_active_editor")
                        .with_meta("EditorID", &id)
                        .with_meta("EditorPID", pid);
                report_failure(self.reporter.as_ref(), &error, report);
                return Err(error);
            }
            tokio::time::sleep(self.config.restart_poll_interval).await;
        }

        self.run_editor(request);
        Ok(Some(id))
    }

    /// Records the current foreground before a focus-stealing surface opens.
    pub async fn capture_focus(&self) {
        let editors = self.editors(SortTarget::Menubar).await;
        let current = frontmost_app(&self.foreground).await;
        self.tracker.set_activation_target(current, &editors);
    }

    pub async fn restore_focus(&self) {
        let tracker = self.tracker.clone();
        let Some(restored) = on_desktop(move || tracker.activate_target()).await else {
            return;
        };
        match restored {
            Ok(Some(ActivationTarget::Editor { pid })) => {
                self.send(RegistryCommand::Touch { pid });
            }
            Ok(_) => {}
            Err(error) => {
                let report = ReportableError::new(
                    "Failed to restore the previous activation target",
                    "registry::restore_focus",
                );
                report_failure(self.reporter.as_ref(), &error, report);
            }
        }
    }

    /// Called when the switcher hides. Focus is only handed back while the hub
    /// still owns it; otherwise the user has already moved elsewhere.
    pub async fn switcher_dismissed(&self) {
        let hub_is_frontmost = frontmost_app(&self.foreground)
            .await
            .is_some_and(|app| app.pid == self.tracker.hub_pid());
        if hub_is_frontmost {
            self.restore_focus().await;
        }
    }

    /// The hub lost active status. Returns whether the switcher must be hidden.
    pub async fn handle_resign_active(&self, switcher_visible: bool) -> bool {
        if switcher_visible {
            self.switcher_dismissed().await;
        }
        switcher_visible
    }

    pub async fn toggle_last_active_editor(&self) -> ToggleOutcome {
        let Some(editor) = self
            .editors(SortTarget::LastActiveEditor)
            .await
            .into_iter()
            .next()
        else {
            return ToggleOutcome::ShowSwitcher;
        };

        match frontmost_app(&self.foreground).await {
            Some(front) if front.pid != editor.pid => {
                let editors = self.editors(SortTarget::Menubar).await;
                self.tracker.set_activation_target(Some(front), &editors);
                self.activate_editor(&editor.id).await;
                ToggleOutcome::Activated(editor.id)
            }
            _ => {
                let foreground = self.foreground.clone();
                let pid = editor.pid;
                on_desktop(move || {
                    if let Some(app) = foreground.app_for_pid(pid) {
                        foreground.hide(&app);
                    }
                })
                .await;
                ToggleOutcome::Hidden(editor.id)
            }
        }
    }

    /// With exactly one editor the switcher hotkey flips focus directly.
    pub async fn toggle_switcher(&self) -> ToggleOutcome {
        let editors = self.editors(SortTarget::Switcher).await;
        let [editor] = editors.as_slice() else {
            return ToggleOutcome::ShowSwitcher;
        };

        match frontmost_app(&self.foreground).await {
            Some(front) if front.pid == editor.pid => {
                self.restore_focus().await;
                self.tracker.set_activation_target(Some(front), &editors);
                ToggleOutcome::Restored
            }
            Some(front) => {
                self.tracker.set_activation_target(Some(front), &editors);
                self.activate_editor(&editor.id).await;
                ToggleOutcome::Activated(editor.id.clone())
            }
            None => {
                self.activate_editor(&editor.id).await;
                ToggleOutcome::Activated(editor.id.clone())
            }
        }
    }
}
