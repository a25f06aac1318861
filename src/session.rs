//! Conversation session: setup, turn loop, teardown.
//!
//! When the transport fails to prepare, the configured fallback transport
//! takes over; any other setup failure aborts the session. A failed turn is logged and the loop
//! keeps reading input. Teardown runs once on every path after setup began.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chat::ChatService;
use crate::config::{RobotConfig, SessionConfig};
use crate::delivery::{DeliveryOrchestrator, DeliveryReport};
use crate::device::{RemoteDevice, RemoteSession, SessionState};
use crate::error::{DeviceError, SetupError};
use crate::history::{DeliveryHistory, DeliveryRecord};
use crate::speech::SpeechSynthesizer;
use crate::transport::Transport;

const DEFAULT_FALLBACK_REPLY: &str = "Ha ocurrido un error al procesar tu mensaje.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub turns: usize,
    pub delivered: usize,
    pub failed: usize,
}

pub struct SessionLoop {
    config: SessionConfig,
    delivery: DeliveryOrchestrator,
    chat: Option<Box<dyn ChatService>>,
    speech: Arc<dyn SpeechSynthesizer>,
    device: Option<Arc<dyn RemoteDevice>>,
    serial: String,
    search_timeout: Duration,
    fallback_reply: String,
    history: Option<DeliveryHistory>,
    shutdown: CancellationToken,
    session: Option<RemoteSession>,
    fallback_transport: Option<Box<dyn Transport>>,
}

impl SessionLoop {
    pub fn new(
        config: SessionConfig,
        delivery: DeliveryOrchestrator,
        speech: Arc<dyn SpeechSynthesizer>,
    ) -> Self {
        let robot = RobotConfig::default();
        Self {
            config,
            delivery,
            chat: None,
            speech,
            device: None,
            serial: robot.serial,
            search_timeout: Duration::from_secs(robot.search_timeout_secs),
            fallback_reply: DEFAULT_FALLBACK_REPLY.to_string(),
            history: None,
            shutdown: CancellationToken::new(),
            session: None,
            fallback_transport: None,
        }
    }

    /// Without a chat service each input line is spoken back verbatim.
    pub fn with_chat(mut self, chat: Box<dyn ChatService>) -> Self {
        self.chat = Some(chat);
        self
    }

    pub fn with_device(mut self, device: Arc<dyn RemoteDevice>, robot: &RobotConfig) -> Self {
        self.device = Some(device);
        self.serial = robot.serial.clone();
        self.search_timeout = Duration::from_secs(robot.search_timeout_secs);
        self
    }

    /// Used in place of the primary transport if its setup fails.
    pub fn with_fallback_transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.fallback_transport = Some(transport);
        self
    }

    pub fn with_history(mut self, history: Option<DeliveryHistory>) -> Self {
        self.history = history;
        self
    }

    pub fn with_fallback_reply(mut self, reply: impl Into<String>) -> Self {
        self.fallback_reply = reply.into();
        self
    }

    /// Cancelling the token ends the loop at the next input wait.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Run a full conversation over `input`, one message per line.
    pub async fn run<R>(&mut self, input: R) -> Result<SessionSummary, SetupError>
    where
        R: AsyncBufRead + Unpin,
    {
        let result = match self.setup().await {
            Ok(session) => Ok(self.converse(input, &session).await),
            Err(e) => {
                error!("Session setup failed: {e}");
                Err(e)
            }
        };
        self.teardown().await;
        result
    }

    /// Set up, deliver `text` once, tear down.
    pub async fn say(&mut self, text: &str) -> Result<bool, SetupError> {
        let result = match self.setup().await {
            Ok(session) => Ok(self
                .speak(text, &session, 0)
                .await
                .is_some_and(|report| report.succeeded())),
            Err(e) => {
                error!("Session setup failed: {e}");
                Err(e)
            }
        };
        self.teardown().await;
        result
    }

    async fn setup(&mut self) -> Result<RemoteSession, SetupError> {
        self.session = None;
        let mut backend = self.delivery.transport_mut().backend();
        info!("Preparing {backend} transport...");
        if let Err(e) = self.delivery.transport_mut().prepare().await {
            let Some(fallback) = self.fallback_transport.take() else {
                return Err(e);
            };
            warn!("{backend} setup failed: {e}. Switching to {} transport", fallback.backend());
            let mut failed = self.delivery.replace_transport(fallback);
            failed.shutdown().await;

            backend = self.delivery.transport_mut().backend();
            info!("Preparing {backend} transport...");
            self.delivery.transport_mut().prepare().await?;
        }

        if !self.delivery.transport_mut().requires_remote_device() {
            let session = RemoteSession::local(backend.to_string());
            self.session = Some(session.clone());
            info!("Playback is local, no robot needed");
            return Ok(session);
        }

        let device = self.device.clone().ok_or(DeviceError::NotAttached)?;

        info!("Searching for robot {}...", self.serial);
        let found = device
            .find(&self.serial, self.search_timeout)
            .await?
            .ok_or_else(|| SetupError::DeviceNotFound(self.serial.clone()))?;
        info!("Found {} at {}:{}", found.name, found.address, found.port);

        if !device.connect(&found).await? {
            return Err(SetupError::ConnectRefused(found.name));
        }
        self.set_state(&found.name, SessionState::Connected);

        if !device.enter_program().await? {
            return Err(SetupError::EnterModeRefused);
        }
        self.set_state(&found.name, SessionState::Programming);

        Ok(RemoteSession {
            handle: found.name,
            state: SessionState::Programming,
        })
    }

    fn set_state(&mut self, handle: &str, next: SessionState) {
        match &mut self.session {
            Some(session) => {
                info!("State: {} → {next}", session.state);
                session.state = next;
            }
            None => {
                info!("State: {next}");
                self.session = Some(RemoteSession {
                    handle: handle.to_string(),
                    state: next,
                });
            }
        }
    }

    async fn converse<R>(&mut self, input: R, session: &RemoteSession) -> SessionSummary
    where
        R: AsyncBufRead + Unpin,
    {
        let mut summary = SessionSummary::default();

        if let Some(greeting) = self.config.greeting.clone() {
            info!("Playing greeting");
            self.speak(&greeting, session, 0).await;
        }

        let mut lines = input.lines();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                _ = self.shutdown.cancelled() => {
                    info!("Interrupted");
                    break;
                }
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("End of input");
                    break;
                }
                Err(e) => {
                    warn!("Failed to read input: {e}");
                    break;
                }
            };

            let message = line.trim();
            if message.is_empty() {
                continue;
            }
            if self.is_stop_word(message) {
                info!("Stop word received");
                break;
            }

            summary.turns += 1;
            let started = Instant::now();
            let reply = match &mut self.chat {
                Some(chat) => match chat.respond(message).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!("Chat failed: {e}, using fallback reply");
                        self.fallback_reply.clone()
                    }
                },
                None => message.to_string(),
            };
            let chat_ms = started.elapsed().as_millis() as i64;
            info!("Reply: {reply}");

            match self.speak(&reply, session, chat_ms).await {
                Some(report) if report.succeeded() => summary.delivered += 1,
                _ => summary.failed += 1,
            }
        }

        info!(
            "Session finished: {} turn(s), {} delivered, {} failed",
            summary.turns, summary.delivered, summary.failed
        );
        summary
    }

    fn is_stop_word(&self, message: &str) -> bool {
        self.config
            .stop_words
            .iter()
            .any(|w| w.trim().to_lowercase() == message.to_lowercase())
    }

    /// Synthesize and deliver one utterance. None if synthesis failed.
    async fn speak(&mut self, text: &str, session: &RemoteSession, chat_ms: i64) -> Option<DeliveryReport> {
        let started = Instant::now();
        let audio = match self.speech.synthesize(text).await {
            Ok(audio) => audio,
            Err(e) => {
                error!("Speech synthesis failed: {e}");
                return None;
            }
        };
        let speech_ms = started.elapsed().as_millis() as i64;

        let started = Instant::now();
        let report = self.delivery.deliver(&audio, "", session).await;
        let delivery_ms = started.elapsed().as_millis() as i64;

        if let Some(history) = &self.history {
            let mut record = DeliveryRecord::from_report(&report, text);
            record.chat_latency_ms = chat_ms;
            record.speech_latency_ms = speech_ms;
            record.delivery_latency_ms = delivery_ms;
            history.save(&record);
        }
        Some(report)
    }

    async fn teardown(&mut self) {
        info!("Tearing down session...");
        if let (Some(session), Some(device)) = (&mut self.session, &self.device) {
            if session.state == SessionState::Programming {
                match device.quit_program().await {
                    Ok(()) => info!("Program mode exited"),
                    Err(e) => warn!("Failed to exit program mode: {e}"),
                }
            }
            if session.is_active() {
                match device.release().await {
                    Ok(()) => info!("Robot {} released", session.handle),
                    Err(e) => warn!("Failed to release robot: {e}"),
                }
            }
            if session.state != SessionState::Local {
                info!("State: {} → {}", session.state, SessionState::Released);
                session.state = SessionState::Released;
            }
        }
        self.delivery.transport_mut().shutdown().await;
        info!("Session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::testing::{CountingStore, FakeTransport};
    use crate::delivery::RetryPolicy;
    use crate::error::{ChatError, SpeechError};
    use crate::playback::testing::FakeDevice;
    use crate::playback::PlaybackCommander;
    use crate::transport::Backend;
    use async_trait::async_trait;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    struct EchoChat;

    #[async_trait]
    impl ChatService for EchoChat {
        async fn respond(&mut self, message: &str) -> Result<String, ChatError> {
            if message == "boom" {
                return Err(ChatError::EmptyReply);
            }
            Ok(format!("eco: {message}"))
        }
    }

    struct BytesSpeech;

    #[async_trait]
    impl SpeechSynthesizer for BytesSpeech {
        async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SpeechError> {
            if text.is_empty() {
                return Err(SpeechError::EmptyText);
            }
            Ok(text.as_bytes().to_vec())
        }
    }

    struct Harness {
        store: Arc<CountingStore>,
        device: Arc<FakeDevice>,
        shutdowns: Arc<std::sync::atomic::AtomicUsize>,
        publishes: Arc<std::sync::atomic::AtomicUsize>,
        session: SessionLoop,
    }

    fn harness(device: FakeDevice, transport: FakeTransport, config: SessionConfig) -> Harness {
        let store = Arc::new(CountingStore::new());
        let device = Arc::new(device);
        let shutdowns = transport.shutdowns.clone();
        let publishes = transport.publishes.clone();
        let delivery = DeliveryOrchestrator::new(
            store.clone(),
            Box::new(transport),
            PlaybackCommander::new(Some(device.clone()), 1.0),
            RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_secs(2),
                grace: Duration::from_secs(5),
            },
        );
        let session = SessionLoop::new(config, delivery, Arc::new(BytesSpeech))
            .with_chat(Box::new(EchoChat))
            .with_device(device.clone(), &RobotConfig::default());
        Harness {
            store,
            device,
            shutdowns,
            publishes,
            session,
        }
    }

    fn plays(device: &FakeDevice) -> usize {
        device.log().iter().filter(|e| e.starts_with("play ")).count()
    }

    #[tokio::test(start_paused = true)]
    async fn full_conversation_until_stop_word() {
        let mut h = harness(
            FakeDevice::ready(),
            FakeTransport::new(Backend::LocalServe),
            SessionConfig::default(),
        );

        let summary = h.session.run(&b"hola\n\n   \nboom\nSALIR\nignored\n"[..]).await.unwrap();

        assert_eq!(
            summary,
            SessionSummary {
                turns: 2,
                delivered: 2,
                failed: 0
            }
        );
        let log = h.device.log();
        assert_eq!(&log[..3], &["find 20256", "connect Mini_20256", "enter_program"]);
        assert_eq!(&log[log.len() - 2..], &["quit_program", "release"]);
        assert_eq!(plays(&h.device), 2);
        assert_eq!(h.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.deletes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_device_aborts_before_any_delivery() {
        let mut h = harness(
            FakeDevice::default(),
            FakeTransport::new(Backend::LocalServe),
            SessionConfig::default(),
        );

        let err = h.session.run(&b"hola\n"[..]).await.unwrap_err();

        assert!(matches!(err, SetupError::DeviceNotFound(ref s) if s == "20256"));
        assert_eq!(h.device.log(), vec!["find 20256".to_string()]);
        assert_eq!(h.publishes.load(Ordering::SeqCst), 0);
        assert_eq!(h.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_program_mode_still_releases() {
        let device = FakeDevice {
            accept_program: false,
            ..FakeDevice::ready()
        };
        let mut h = harness(device, FakeTransport::new(Backend::LocalServe), SessionConfig::default());

        let err = h.session.run(&b"hola\n"[..]).await.unwrap_err();

        assert!(matches!(err, SetupError::EnterModeRefused));
        let log = h.device.log();
        assert_eq!(log.last().map(String::as_str), Some("release"));
        assert!(!log.contains(&"quit_program".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_setup_failure_is_fatal() {
        let mut transport = FakeTransport::new(Backend::RemotePublish);
        transport.prepare_error = Some("clone failed".into());
        let mut h = harness(FakeDevice::ready(), transport, SessionConfig::default());

        assert!(matches!(
            h.session.run(&b"hola\n"[..]).await,
            Err(SetupError::Transport(_))
        ));
        assert!(h.device.log().is_empty());
        assert_eq!(h.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_bluetooth_setup_switches_to_robot_playback() {
        let mut bluetooth = FakeTransport::new(Backend::BluetoothPush);
        bluetooth.prepare_error = Some("connection refused".into());
        let bluetooth_shutdowns = bluetooth.shutdowns.clone();
        let local = FakeTransport::new(Backend::LocalServe);
        let local_publishes = local.publishes.clone();
        let local_shutdowns = local.shutdowns.clone();

        let h = harness(FakeDevice::ready(), bluetooth, SessionConfig::default());
        let mut session = h.session.with_fallback_transport(Box::new(local));

        let summary = session.run(&b"hola\n"[..]).await.unwrap();

        assert_eq!(summary.delivered, 1);
        assert_eq!(local_publishes.load(Ordering::SeqCst), 1);
        assert_eq!(h.publishes.load(Ordering::SeqCst), 0);
        assert_eq!(bluetooth_shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(local_shutdowns.load(Ordering::SeqCst), 1);
        let log = h.device.log();
        assert_eq!(&log[..3], &["find 20256", "connect Mini_20256", "enter_program"]);
        assert_eq!(plays(&h.device), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_fallback_setup_is_fatal() {
        let mut primary = FakeTransport::new(Backend::BluetoothPush);
        primary.prepare_error = Some("connection refused".into());
        let mut fallback = FakeTransport::new(Backend::LocalServe);
        fallback.prepare_error = Some("port in use".into());
        let fallback_shutdowns = fallback.shutdowns.clone();

        let h = harness(FakeDevice::ready(), primary, SessionConfig::default());
        let mut session = h.session.with_fallback_transport(Box::new(fallback));

        let err = session.run(&b"hola\n"[..]).await.unwrap_err();
        assert!(matches!(err, SetupError::Transport(ref reason) if reason == "port in use"));
        assert!(h.device.log().is_empty());
        assert_eq!(fallback_shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_turn_does_not_end_session() {
        let device = FakeDevice::ready().with_play_codes(&[7, 7, 7]);
        let mut h = harness(device, FakeTransport::new(Backend::LocalServe), SessionConfig::default());

        let summary = h.session.run(&b"primero\nsegundo\n"[..]).await.unwrap();

        assert_eq!(summary.turns, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.delivered, 1);
        assert_eq!(plays(&h.device), 4);
        assert_eq!(h.store.deletes(), 2);
        assert_eq!(h.store.leftover_files(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn local_playback_needs_no_robot() {
        let mut h = harness(
            FakeDevice::ready(),
            FakeTransport::new(Backend::BluetoothPush),
            SessionConfig::default(),
        );

        let summary = h.session.run(&b"hola\n"[..]).await.unwrap();

        assert_eq!(summary.delivered, 1);
        assert!(h.device.log().is_empty());
        assert_eq!(h.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn greeting_and_history_are_recorded() {
        let dir = TempDir::new().unwrap();
        let history = DeliveryHistory::new(dir.path().to_path_buf());
        let config = SessionConfig {
            greeting: Some("Prueba de audio".into()),
            ..SessionConfig::default()
        };
        let h = harness(FakeDevice::ready(), FakeTransport::new(Backend::LocalServe), config);
        let mut session = h.session.with_history(Some(history.clone()));

        session.run(&b"hola\n"[..]).await.unwrap();

        let records = history.load("today");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].reply_text, "Prueba de audio");
        assert_eq!(records[1].reply_text, "eco: hola");
        assert!(records.iter().all(|r| r.succeeded() && r.attempts == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_loop_with_teardown() {
        let token = CancellationToken::new();
        let h = harness(
            FakeDevice::ready(),
            FakeTransport::new(Backend::LocalServe),
            SessionConfig::default(),
        );
        let mut session = h.session.with_shutdown(token.clone());

        // never yields a line
        let (_writer, reader) = tokio::io::duplex(64);
        token.cancel();
        let summary = session.run(tokio::io::BufReader::new(reader)).await.unwrap();

        assert_eq!(summary.turns, 0);
        assert_eq!(h.device.log().last().map(String::as_str), Some("release"));
        assert_eq!(h.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn without_chat_input_is_spoken_verbatim() {
        let dir = TempDir::new().unwrap();
        let history = DeliveryHistory::new(dir.path().to_path_buf());
        let store = Arc::new(CountingStore::new());
        let delivery = DeliveryOrchestrator::new(
            store,
            Box::new(FakeTransport::new(Backend::BluetoothPush)),
            PlaybackCommander::new(None, 1.0),
            RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_secs(2),
                grace: Duration::ZERO,
            },
        );
        let mut session = SessionLoop::new(SessionConfig::default(), delivery, Arc::new(BytesSpeech))
            .with_history(Some(history.clone()));

        let summary = session.run(&b"Prueba de audio\n"[..]).await.unwrap();

        assert_eq!(summary.delivered, 1);
        assert_eq!(history.load("today")[0].reply_text, "Prueba de audio");
    }

    #[tokio::test(start_paused = true)]
    async fn say_delivers_once() {
        let mut h = harness(
            FakeDevice::ready(),
            FakeTransport::new(Backend::LocalServe),
            SessionConfig::default(),
        );

        assert!(h.session.say("Prueba de audio").await.unwrap());
        assert_eq!(plays(&h.device), 1);
        assert_eq!(h.shutdowns.load(Ordering::SeqCst), 1);
    }
}
