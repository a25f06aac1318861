//! Playback commander: asks the device to play a published address and
//! interprets its single structured reply.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::device::{PlayAudioRequest, RemoteDevice, RemoteSession, ResultType, StorageType};
use crate::transport::{Backend, PublishResult};

/// Result code used when the device never produced one.
pub const CODE_NO_RESPONSE: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Success,
    Failure { code: i32, reason: String },
}

impl PlaybackOutcome {
    fn no_response(reason: impl Into<String>) -> Self {
        Self::Failure {
            code: CODE_NO_RESPONSE,
            reason: reason.into(),
        }
    }
}

pub struct PlaybackCommander {
    device: Option<Arc<dyn RemoteDevice>>,
    volume: f32,
}

impl PlaybackCommander {
    pub fn new(device: Option<Arc<dyn RemoteDevice>>, volume: f32) -> Self {
        Self {
            device,
            volume: volume.clamp(0.0, 1.0),
        }
    }

    /// Issue one play command and wait for its outcome.
    ///
    /// Takes `&mut self` so a second command cannot be pipelined while the
    /// first is outstanding.
    pub async fn command_play(&mut self, published: &PublishResult, session: &RemoteSession) -> PlaybackOutcome {
        if published.backend == Backend::BluetoothPush {
            return published
                .local_outcome
                .clone()
                .unwrap_or_else(|| PlaybackOutcome::no_response("local playback did not run"));
        }

        let Some(device) = &self.device else {
            return PlaybackOutcome::no_response("no remote device attached");
        };
        if !session.is_active() {
            return PlaybackOutcome::no_response(format!("session {} is {}", session.handle, session.state));
        }

        let request = PlayAudioRequest {
            url: published.address.clone(),
            storage_type: StorageType::NetPublic,
            volume: self.volume,
        };
        debug!("Play command: {}", request.url);

        match device.play_audio(&request).await {
            Ok(resp) if resp.result_type == ResultType::Success && resp.is_success => PlaybackOutcome::Success,
            Ok(resp) => PlaybackOutcome::Failure {
                code: resp.result_code,
                reason: format!("device reported {:?} (code {})", resp.result_type, resp.result_code),
            },
            Err(e) => {
                warn!("Play command failed: {e}");
                PlaybackOutcome::no_response(e.to_string())
            }
        }
    }
}
