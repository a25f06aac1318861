//! Transports make an artifact reachable by the playback device.
//!
//! - `local`: ad-hoc HTTP server over the artifact directory
//! - `bluetooth`: plays through the OS audio stack routed to a paired speaker
//! - `remote`: commits into a git-hosted static site served from a CDN

pub mod bluetooth;
pub mod local;
pub mod remote;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::artifact::Artifact;
use crate::config::Config;
use crate::error::{PublishError, SetupError};
use crate::playback::PlaybackOutcome;
use crate::process::CommandRunner;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    #[value(name = "local")]
    LocalServe,
    #[value(name = "bluetooth")]
    BluetoothPush,
    #[value(name = "remote")]
    RemotePublish,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalServe => write!(f, "local-serve"),
            Self::BluetoothPush => write!(f, "bluetooth-push"),
            Self::RemotePublish => write!(f, "remote-publish"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishResult {
    /// URL for network backends, the local path for Bluetooth.
    pub address: String,
    pub backend: Backend,
    pub published_at: DateTime<Local>,
    /// Set when publishing already played the audio locally.
    pub local_outcome: Option<PlaybackOutcome>,
}

impl PublishResult {
    pub fn url(address: String, backend: Backend) -> Self {
        Self {
            address,
            backend,
            published_at: Local::now(),
            local_outcome: None,
        }
    }
}

#[async_trait]
pub trait Transport: Send {
    fn backend(&self) -> Backend;

    /// Whether playback needs a connected remote device session.
    fn requires_remote_device(&self) -> bool {
        true
    }

    /// One-time setup before the first publish. Failure aborts the session.
    async fn prepare(&mut self) -> Result<(), SetupError> {
        Ok(())
    }

    async fn publish(&mut self, artifact: &Artifact) -> Result<PublishResult, PublishError>;

    /// Release held resources. Safe to call when never prepared, or twice.
    async fn shutdown(&mut self) {}
}

/// Select the transport named by `backend`.
pub fn build_transport(
    backend: Backend,
    config: &Config,
    runner: Arc<dyn CommandRunner>,
) -> Box<dyn Transport> {
    info!("Using {backend} transport");
    match backend {
        Backend::LocalServe => Box::new(local::LocalServe::new(
            config.local_serve.clone(),
            config.artifacts.dir.clone(),
        )),
        Backend::BluetoothPush => Box::new(bluetooth::BluetoothPush::new(
            config.bluetooth.clone(),
            runner,
        )),
        Backend::RemotePublish => Box::new(remote::RemotePublish::new(
            config.remote_publish.clone(),
            runner,
        )),
    }
}
