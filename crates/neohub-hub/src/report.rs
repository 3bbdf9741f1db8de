use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use tracing::{error, warn};
use url::Url;

const ISSUE_TRACKER_URL: &str = "https://github.com/alex35mil/NeoHub/issues/new";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportKind {
    FailedToLaunchServer,
    FailedToHandleRequestFromCli,
    FailedToRunEditorProcess,
    FailedToGetRunningEditorApp,
    FailedToActivateEditorApp,
    FailedToRestartEditor,
}

impl ReportKind {
    pub fn id(&self) -> &'static str {
        match self {
            ReportKind::FailedToLaunchServer => "FAILED_TO_LAUNCH_SERVER",
            ReportKind::FailedToHandleRequestFromCli => "FAILED_TO_HANDLE_REQUEST_FROM_CLI",
            ReportKind::FailedToRunEditorProcess => "FAILED_TO_RUN_EDITOR_PROCESS",
            ReportKind::FailedToGetRunningEditorApp => "FAILED_TO_GET_RUNNING_EDITOR_APP",
            ReportKind::FailedToActivateEditorApp => "FAILED_TO_ACTIVATE_EDITOR_APP",
            ReportKind::FailedToRestartEditor => "FAILED_TO_RESTART_EDITOR",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            ReportKind::FailedToLaunchServer => "Failed to launch the NeoHub server",
            ReportKind::FailedToHandleRequestFromCli | ReportKind::FailedToRunEditorProcess => {
                "Failed to open the editor"
            }
            ReportKind::FailedToGetRunningEditorApp | ReportKind::FailedToActivateEditorApp => {
                "Failed to activate the editor"
            }
            ReportKind::FailedToRestartEditor => "Failed to restart the editor",
        }
    }

    pub fn body(&self) -> &'static str {
        match self {
            ReportKind::FailedToLaunchServer => {
                "NeoHub won't be able to function properly. Please, create an issue in the GitHub repo."
            }
            ReportKind::FailedToGetRunningEditorApp => "Requested editor instance is not running.",
            ReportKind::FailedToRestartEditor => {
                "The editor did not quit in time. Restart it manually or report the issue."
            }
            _ => "Please create an issue in the GitHub repo.",
        }
    }
}

/// Structured failure handed to the reporting sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportableError {
    message: String,
    context: String,
    code: Option<i32>,
    meta: BTreeMap<String, String>,
    source: Option<String>,
    version: &'static str,
    os: &'static str,
    arch: &'static str,
}

impl ReportableError {
    pub fn new(message: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: context.into(),
            code: None,
            meta: BTreeMap::new(),
            source: None,
            version: env!("CARGO_PKG_VERSION"),
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.meta.insert(key.into(), value.to_string());
        self
    }

    pub fn with_source(mut self, source: &dyn fmt::Display) -> Self {
        self.source = Some(source.to_string());
        self
    }

    /// Nests this report under an outer operation. Existing metadata keys win.
    pub fn wrap(
        mut self,
        message: &str,
        context: &str,
        meta: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        if message != self.message {
            self.message = format!("{message} → {}", self.message);
        }
        if context != self.context {
            self.context = format!("{context} → {}", self.context);
        }
        for (key, value) in meta {
            self.meta.entry(key).or_insert(value);
        }
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }

    pub fn meta(&self) -> &BTreeMap<String, String> {
        &self.meta
    }

    pub fn issue_url(&self) -> String {
        let body = format!(
            "## What happened?\n_Reproduction steps, context, etc._\n\n## Error details\n```\n{self}\n```"
        );
        match Url::parse_with_params(
            ISSUE_TRACKER_URL,
            &[
                ("title", self.message.as_str()),
                ("body", body.as_str()),
                ("labels", "user-report"),
            ],
        ) {
            Ok(url) => url.to_string(),
            Err(err) => {
                warn!(event = "report_url_error", error = %err);
                ISSUE_TRACKER_URL.to_string()
            }
        }
    }
}

impl fmt::Display for ReportableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        writeln!(f, "App: Version {}", self.version)?;
        writeln!(f, "OS: {}", self.os)?;
        writeln!(f, "Arch: {}", self.arch)?;
        write!(f, "Context: {}", self.context)?;
        if let Some(code) = self.code {
            write!(f, "\nCode: {code}")?;
        }
        if let Some(source) = &self.source {
            write!(f, "\nOriginal Error: {source}")?;
        }
        if !self.meta.is_empty() {
            write!(f, "\nMetadata:")?;
            for (key, value) in &self.meta {
                write!(f, "\n    {key}: {value}")?;
            }
        }
        Ok(())
    }
}

pub trait Reporter: Send + Sync {
    fn report(&self, kind: ReportKind, error: &ReportableError);
}

/// Default sink: user-facing notification delivery lives outside the hub, so
/// reports end up in the log together with a prefilled issue link.
#[derive(Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, kind: ReportKind, error: &ReportableError) {
        error!(
            event = "hub_failure_report",
            kind = kind.id(),
            title = kind.title(),
            body = kind.body(),
            message = error.message(),
            context = error.context(),
            issue_url = %error.issue_url(),
        );
    }
}

/// Keeps every report in memory. Useful for embedding UIs that poll for failures.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<(ReportKind, ReportableError)>>,
}

impl RecordingReporter {
    pub fn reports(&self) -> Vec<(ReportKind, ReportableError)> {
        self.reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn kinds(&self) -> Vec<ReportKind> {
        self.reports().into_iter().map(|(kind, _)| kind).collect()
    }
}

impl Reporter for RecordingReporter {
    fn report(&self, kind: ReportKind, error: &ReportableError) {
        self.reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((kind, error.clone()));
    }
}
