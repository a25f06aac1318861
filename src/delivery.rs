//! Delivery orchestration with a retry state machine.
//!
//! CREATED → PUBLISHING → AWAITING_CONFIRMATION → SUCCEEDED
//!                ↑              │
//!                └─ RETRY_SCHEDULED ←┘ (until the attempt cap) → FAILED
//!
//! The artifact is deleted exactly once on every exit path: after the
//! grace period on a terminal state, or immediately if the delivery future
//! is dropped mid-flight.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::{error, info, warn};

use crate::artifact::{Artifact, ArtifactStore};
use crate::config::DeliveryConfig;
use crate::device::RemoteSession;
use crate::error::PublishError;
use crate::playback::{PlaybackCommander, PlaybackOutcome};
use crate::transport::{Backend, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    /// Delay before deleting a finished artifact, for slow fetchers.
    pub grace: Duration,
}

impl From<&DeliveryConfig> for RetryPolicy {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config.retry_backoff(),
            grace: config.grace_period(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Created,
    Publishing,
    AwaitingConfirmation,
    RetryScheduled,
    Succeeded,
    Failed,
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Publishing => write!(f, "PUBLISHING"),
            Self::AwaitingConfirmation => write!(f, "AWAITING_CONFIRMATION"),
            Self::RetryScheduled => write!(f, "RETRY_SCHEDULED"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Store(String),
    Publish(PublishError),
    Playback { code: i32, reason: String },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(reason) => write!(f, "artifact store: {reason}"),
            Self::Publish(e) => write!(f, "{e}"),
            Self::Playback { code, reason } => write!(f, "playback failed (code {code}): {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    /// Retried until the attempt cap. Publish and playback failures land here.
    TransientFailure(FailureReason),
    /// Ends the attempt sequence at once.
    FatalFailure(FailureReason),
}

#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    pub timestamp: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub artifact_id: Option<String>,
    pub backend: Backend,
    pub state: DeliveryState,
    pub attempts: Vec<DeliveryAttempt>,
    /// Reason of the last failed attempt, kept as-is rather than summarised.
    pub reason: Option<FailureReason>,
    pub address: Option<String>,
}

impl DeliveryReport {
    pub fn succeeded(&self) -> bool {
        self.state == DeliveryState::Succeeded
    }
}

/// Deletes its artifact once: via `finish`, or on drop if never finished.
struct ArtifactGuard {
    store: Arc<dyn ArtifactStore>,
    artifact: Option<Artifact>,
}

impl ArtifactGuard {
    fn finish(mut self) {
        if let Some(artifact) = self.artifact.take() {
            delete_logged(self.store.as_ref(), &artifact);
        }
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        if let Some(artifact) = self.artifact.take() {
            warn!("Delivery interrupted, removing {}", artifact.file_name());
            delete_logged(self.store.as_ref(), &artifact);
        }
    }
}

fn delete_logged(store: &dyn ArtifactStore, artifact: &Artifact) {
    match store.delete(artifact) {
        Ok(()) => info!("Artifact {} removed", artifact.file_name()),
        Err(e) => error!("Failed to remove artifact: {e}"),
    }
}

pub struct DeliveryOrchestrator {
    store: Arc<dyn ArtifactStore>,
    transport: Box<dyn Transport>,
    commander: PlaybackCommander,
    policy: RetryPolicy,
}

impl DeliveryOrchestrator {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        transport: Box<dyn Transport>,
        commander: PlaybackCommander,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            transport,
            commander,
            policy,
        }
    }

    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    /// Swap in another transport, returning the previous one.
    pub fn replace_transport(&mut self, transport: Box<dyn Transport>) -> Box<dyn Transport> {
        std::mem::replace(&mut self.transport, transport)
    }

    /// Store `content`, publish it, and confirm playback, retrying transient
    /// failures up to the policy's attempt cap.
    pub async fn deliver(&mut self, content: &[u8], name_hint: &str, session: &RemoteSession) -> DeliveryReport {
        let backend = self.transport.backend();

        let artifact = match self.store.create(content, name_hint) {
            Ok(artifact) => artifact,
            Err(e) => {
                error!("Cannot create audio artifact: {e}");
                return DeliveryReport {
                    artifact_id: None,
                    backend,
                    state: DeliveryState::Failed,
                    attempts: Vec::new(),
                    reason: Some(FailureReason::Store(e.to_string())),
                    address: None,
                };
            }
        };
        info!("Audio artifact created: {}", artifact.file_name());

        let guard = ArtifactGuard {
            store: self.store.clone(),
            artifact: Some(artifact.clone()),
        };

        let mut state = DeliveryState::Created;
        let mut attempts: Vec<DeliveryAttempt> = Vec::new();
        let mut reason = None;
        let mut address = None;

        let terminal = loop {
            let attempt_number = attempts.len() as u32 + 1;
            transition(&mut state, DeliveryState::Publishing);
            info!(
                "Attempt {attempt_number}/{} via {backend}",
                self.policy.max_attempts
            );

            let outcome = match self.transport.publish(&artifact).await {
                Err(e) => AttemptOutcome::TransientFailure(FailureReason::Publish(e)),
                Ok(published) => {
                    info!("Audio URL: {}", published.address);
                    address = Some(published.address.clone());
                    transition(&mut state, DeliveryState::AwaitingConfirmation);
                    match self.commander.command_play(&published, session).await {
                        PlaybackOutcome::Success => AttemptOutcome::Success,
                        PlaybackOutcome::Failure { code, reason } => {
                            AttemptOutcome::TransientFailure(FailureReason::Playback { code, reason })
                        }
                    }
                }
            };

            attempts.push(DeliveryAttempt {
                attempt_number,
                outcome: outcome.clone(),
                timestamp: Local::now(),
            });

            match outcome {
                AttemptOutcome::Success => {
                    info!("Audio played successfully (attempt {attempt_number})");
                    break DeliveryState::Succeeded;
                }
                AttemptOutcome::FatalFailure(failure) => {
                    error!("Attempt {attempt_number} failed, not retrying: {failure}");
                    reason = Some(failure);
                    break DeliveryState::Failed;
                }
                AttemptOutcome::TransientFailure(failure) => {
                    warn!("Attempt {attempt_number} failed: {failure}");
                    reason = Some(failure);
                    if attempt_number >= self.policy.max_attempts {
                        break DeliveryState::Failed;
                    }
                    transition(&mut state, DeliveryState::RetryScheduled);
                    info!("Retrying in {:.1}s...", self.policy.backoff.as_secs_f64());
                    tokio::time::sleep(self.policy.backoff).await;
                }
            }
        };
        transition(&mut state, terminal);

        if terminal == DeliveryState::Failed {
            if let Some(failure) = &reason {
                error!("Delivery failed after {} attempt(s): {failure}", attempts.len());
            }
        }

        if !self.policy.grace.is_zero() {
            tokio::time::sleep(self.policy.grace).await;
        }
        guard.finish();

        DeliveryReport {
            artifact_id: Some(artifact.id),
            backend,
            state,
            attempts,
            reason: if terminal == DeliveryState::Succeeded { None } else { reason },
            address,
        }
    }
}

fn transition(state: &mut DeliveryState, next: DeliveryState) {
    if *state != next {
        info!("State: {state} → {next}");
        *state = next;
    }
}

#[cfg(test)]
pub mod testing {
    //! Fakes shared by delivery and session tests.

    use super::*;
    use crate::artifact::LocalArtifactStore;
    use crate::config::ArtifactConfig;
    use crate::error::StoreError;
    use crate::transport::PublishResult;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Real on-disk store that counts calls.
    pub struct CountingStore {
        inner: LocalArtifactStore,
        pub creates: AtomicUsize,
        pub deletes: AtomicUsize,
        _dir: TempDir,
    }

    impl CountingStore {
        pub fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let inner = LocalArtifactStore::new(&ArtifactConfig {
                dir: dir.path().to_path_buf(),
                prefix: "respuesta".into(),
                extension: "mp3".into(),
            });
            Self {
                inner,
                creates: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
                _dir: dir,
            }
        }

        pub fn deletes(&self) -> usize {
            self.deletes.load(Ordering::SeqCst)
        }

        pub fn leftover_files(&self) -> usize {
            std::fs::read_dir(self.inner.dir()).unwrap().count()
        }
    }

    impl ArtifactStore for CountingStore {
        fn create(&self, content: &[u8], name_hint: &str) -> Result<Artifact, StoreError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.inner.create(content, name_hint)
        }

        fn delete(&self, artifact: &Artifact) -> Result<(), StoreError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.inner.delete(artifact)
        }
    }

    /// Transport whose publish results are scripted; exhausted script = success.
    pub struct FakeTransport {
        pub backend: Backend,
        pub script: Mutex<VecDeque<Result<(), PublishError>>>,
        pub publishes: Arc<AtomicUsize>,
        pub shutdowns: Arc<AtomicUsize>,
        pub prepare_error: Option<String>,
    }

    impl FakeTransport {
        pub fn new(backend: Backend) -> Self {
            Self {
                backend,
                script: Mutex::new(VecDeque::new()),
                publishes: Arc::new(AtomicUsize::new(0)),
                shutdowns: Arc::new(AtomicUsize::new(0)),
                prepare_error: None,
            }
        }

        pub fn with_script(self, script: Vec<Result<(), PublishError>>) -> Self {
            *self.script.lock().unwrap() = script.into();
            self
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn backend(&self) -> Backend {
            self.backend
        }

        fn requires_remote_device(&self) -> bool {
            self.backend != Backend::BluetoothPush
        }

        async fn prepare(&mut self) -> Result<(), crate::error::SetupError> {
            match &self.prepare_error {
                Some(e) => Err(crate::error::SetupError::Transport(e.clone())),
                None => Ok(()),
            }
        }

        async fn publish(&mut self, artifact: &Artifact) -> Result<PublishResult, PublishError> {
            self.publishes.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
            next.map(|()| {
                let mut result = PublishResult::url(
                    format!("http://10.0.0.2:8000/{}", artifact.file_name()),
                    self.backend,
                );
                if self.backend == Backend::BluetoothPush {
                    result.local_outcome = Some(PlaybackOutcome::Success);
                }
                result
            })
        }

        async fn shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }
}
