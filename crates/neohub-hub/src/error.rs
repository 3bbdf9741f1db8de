use crate::report::ReportKind;
use neohub_core::hub_ipc::FrameError;
use std::io;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationFailureReason {
    NotRunning,
    Declined,
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("failed to decode request from the cli: {0}")]
    ProtocolDecodeFailure(#[from] FrameError),
    #[error("failed to run editor process: {0}")]
    ProcessLaunchFailure(String),
    #[error("failed to activate {target}: {reason:?}")]
    ActivationFailure {
        target: String,
        reason: ActivationFailureReason,
    },
    #[error("editor at {id} did not exit within {waited_ms}ms")]
    RestartTimeout { id: String, waited_ms: u64 },
    #[error("failed to start the socket server: {0}")]
    ServerStartFailure(#[from] io::Error),
}

impl HubError {
    pub fn report_kind(&self) -> ReportKind {
        match self {
            HubError::ProtocolDecodeFailure(_) => ReportKind::FailedToHandleRequestFromCli,
            HubError::ProcessLaunchFailure(_) => ReportKind::FailedToRunEditorProcess,
            HubError::ActivationFailure {
                reason: ActivationFailureReason::NotRunning,
                ..
            } => ReportKind::FailedToGetRunningEditorApp,
            HubError::ActivationFailure {
                reason: ActivationFailureReason::Declined,
                ..
            } => ReportKind::FailedToActivateEditorApp,
            HubError::RestartTimeout { .. } => ReportKind::FailedToRestartEditor,
            HubError::ServerStartFailure(_) => ReportKind::FailedToLaunchServer,
        }
    }
}
