//! Error taxonomy shared by the delivery pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Artifact create/delete failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("refusing to store empty audio content")]
    EmptyContent,

    #[error("I/O failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Transport publish failures. Every variant is retried within the attempt cap.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// A sub-step failed; the whole publish is re-run on retry.
    #[error("publish step '{step}' failed: {reason}")]
    Step { step: &'static str, reason: String },

    /// The backend could not publish in its current state.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

impl PublishError {
    pub fn step(step: &'static str, reason: impl Into<String>) -> Self {
        Self::Step {
            step,
            reason: reason.into(),
        }
    }
}

/// Failures that abort a session before (or while) it is established.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("device '{0}' not found")]
    DeviceNotFound(String),

    #[error("connection to device '{0}' refused")]
    ConnectRefused(String),

    #[error("device refused to enter program mode")]
    EnterModeRefused,

    #[error("transport setup failed: {0}")]
    Transport(String),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Errors talking to the remote device boundary.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("device bridge request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("device bridge returned status {0}")]
    Status(u16),

    #[error("no remote device attached to this session")]
    NotAttached,
}

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("missing API key (set {0})")]
    MissingApiKey(String),

    #[error("chat request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("chat service returned status {0}")]
    Status(u16),

    #[error("chat service returned no text")]
    EmptyReply,
}

#[derive(Error, Debug)]
pub enum SpeechError {
    #[error("nothing to synthesize")]
    EmptyText,

    #[error("speech request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("speech service returned status {0}")]
    Status(u16),
}
