use crate::desktop::{AppHandle, ForegroundApps, HubWindows, WindowRef};
use crate::error::{ActivationFailureReason, HubError};
use crate::registry::EditorSnapshot;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// What should get focus back once the switcher goes away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationTarget {
    /// A hub window other than the switcher.
    Hub(WindowRef),
    /// A registered editor, tracked by pid so registry churn can't invalidate it.
    Editor { pid: u32 },
    Other(AppHandle),
}

pub struct ActivationTracker {
    hub_pid: u32,
    foreground: Arc<dyn ForegroundApps>,
    windows: Arc<dyn HubWindows>,
    target: RwLock<Option<ActivationTarget>>,
}

impl ActivationTracker {
    pub fn new(
        hub_pid: u32,
        foreground: Arc<dyn ForegroundApps>,
        windows: Arc<dyn HubWindows>,
    ) -> Self {
        Self {
            hub_pid,
            foreground,
            windows,
            target: RwLock::new(None),
        }
    }

    pub fn hub_pid(&self) -> u32 {
        self.hub_pid
    }

    pub fn set_activation_target(
        &self,
        current_app: Option<AppHandle>,
        editors: &[EditorSnapshot],
    ) {
        let next = current_app.and_then(|app| {
            if app.pid == self.hub_pid {
                return self
                    .windows
                    .main_window()
                    .filter(|window| !self.windows.is_switcher(*window))
                    .map(ActivationTarget::Hub);
            }
            if editors.iter().any(|editor| editor.pid == app.pid) {
                return Some(ActivationTarget::Editor { pid: app.pid });
            }
            Some(ActivationTarget::Other(app))
        });

        debug!(event = "activation_target_set", target = ?next);
        *self
            .target
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
    }

    pub fn activation_target(&self) -> Option<ActivationTarget> {
        self.target
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn editor_target_pid(&self) -> Option<u32> {
        match self.activation_target() {
            Some(ActivationTarget::Editor { pid }) => Some(pid),
            _ => None,
        }
    }

    /// Moves focus to the recorded target. Returns the target that was activated.
    pub fn activate_target(&self) -> Result<Option<ActivationTarget>, HubError> {
        let Some(target) = self.activation_target() else {
            return Ok(None);
        };

        match &target {
            ActivationTarget::Hub(window) => self.windows.activate(*window),
            ActivationTarget::Editor { pid } => {
                let Some(app) = self.foreground.app_for_pid(*pid) else {
                    return Err(HubError::ActivationFailure {
                        target: format!("editor pid {pid}"),
                        reason: ActivationFailureReason::NotRunning,
                    });
                };
                if !self.foreground.activate(&app) {
                    return Err(HubError::ActivationFailure {
                        target: format!("editor pid {pid}"),
                        reason: ActivationFailureReason::Declined,
                    });
                }
            }
            ActivationTarget::Other(app) => {
                if !self.foreground.activate(app) {
                    return Err(HubError::ActivationFailure {
                        target: format!("application pid {}", app.pid),
                        reason: ActivationFailureReason::Declined,
                    });
                }
            }
        }

        info!(event = "activation_target_restored", target = ?target);
        Ok(Some(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EditorId;
    use crate::testing::{FakeDesktop, FakeWindows};
    use chrono::Utc;
    use std::path::PathBuf;

    const HUB_PID: u32 = 10;

    fn snapshot(pid: u32) -> EditorSnapshot {
        let path = PathBuf::from(format!("/work/editor-{pid}"));
        EditorSnapshot {
            id: EditorId::from_path(&path),
            name: format!("editor-{pid}"),
            pid,
            last_access: Utc::now(),
            display_path: path.display().to_string(),
        }
    }

    fn tracker(windows: FakeWindows) -> (ActivationTracker, Arc<FakeDesktop>, Arc<FakeWindows>) {
        let desktop = Arc::new(FakeDesktop::default());
        let windows = Arc::new(windows);
        let tracker = ActivationTracker::new(HUB_PID, desktop.clone(), windows.clone());
        (tracker, desktop, windows)
    }

    #[test]
    fn absent_foreground_clears_target() {
        let (tracker, _, _) = tracker(FakeWindows::default());
        tracker.set_activation_target(Some(AppHandle::new(99)), &[]);
        assert!(tracker.activation_target().is_some());

        tracker.set_activation_target(None, &[]);
        assert_eq!(tracker.activation_target(), None);
        assert_eq!(tracker.activate_target().expect("noop"), None);
    }

    #[test]
    fn hub_foreground_targets_non_switcher_window() {
        let (tracker, _, windows) = tracker(FakeWindows::with_main(WindowRef(1), WindowRef(2)));
        tracker.set_activation_target(Some(AppHandle::new(HUB_PID)), &[]);
        assert_eq!(
            tracker.activation_target(),
            Some(ActivationTarget::Hub(WindowRef(1)))
        );

        tracker.activate_target().expect("activate");
        assert_eq!(windows.activated(), vec![WindowRef(1)]);
    }

    #[test]
    fn hub_foreground_with_only_switcher_visible_has_no_target() {
        let (tracker, _, _) = tracker(FakeWindows::with_main(WindowRef(2), WindowRef(2)));
        tracker.set_activation_target(Some(AppHandle::new(HUB_PID)), &[]);
        assert_eq!(tracker.activation_target(), None);
    }

    #[test]
    fn registered_editor_is_tracked_by_pid() {
        let (tracker, desktop, _) = tracker(FakeWindows::default());
        desktop.add_app(42);
        tracker.set_activation_target(Some(AppHandle::new(42)), &[snapshot(41), snapshot(42)]);
        assert_eq!(tracker.editor_target_pid(), Some(42));

        let activated = tracker.activate_target().expect("activate");
        assert_eq!(activated, Some(ActivationTarget::Editor { pid: 42 }));
        assert_eq!(desktop.activated(), vec![42]);
    }

    #[test]
    fn foreign_app_is_restored_as_is() {
        let (tracker, desktop, _) = tracker(FakeWindows::default());
        tracker.set_activation_target(Some(AppHandle::new(77)), &[snapshot(42)]);
        assert_eq!(
            tracker.activation_target(),
            Some(ActivationTarget::Other(AppHandle::new(77)))
        );
        assert_eq!(tracker.editor_target_pid(), None);

        tracker.activate_target().expect("activate");
        assert_eq!(desktop.activated(), vec![77]);
    }

    #[test]
    fn vanished_editor_fails_activation_and_keeps_target() {
        let (tracker, _, _) = tracker(FakeWindows::default());
        tracker.set_activation_target(Some(AppHandle::new(42)), &[snapshot(42)]);

        let err = tracker.activate_target().expect_err("editor is gone");
        assert!(matches!(
            err,
            HubError::ActivationFailure {
                reason: ActivationFailureReason::NotRunning,
                ..
            }
        ));
        assert_eq!(tracker.editor_target_pid(), Some(42));
    }

    #[test]
    fn declined_focus_is_reported() {
        let (tracker, desktop, _) = tracker(FakeWindows::default());
        desktop.add_app(42);
        desktop.decline_activation(true);
        tracker.set_activation_target(Some(AppHandle::new(42)), &[snapshot(42)]);

        let err = tracker.activate_target().expect_err("declined");
        assert!(matches!(
            err,
            HubError::ActivationFailure {
                reason: ActivationFailureReason::Declined,
                ..
            }
        ));
    }
}
