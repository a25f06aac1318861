//! Bluetooth speaker transport.
//!
//! Pairing and connection go through the platform's own tooling
//! (bluetoothctl, PowerShell, BluetoothConnector). Once connected, the OS
//! routes its default output to the speaker, so "publishing" an artifact
//! means playing it locally: in-process with rodio first, then through
//! external players.

use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use super::{Backend, PublishResult, Transport};
use crate::artifact::Artifact;
use crate::config::BluetoothConfig;
use crate::error::{PublishError, SetupError};
use crate::playback::PlaybackOutcome;
use crate::process::{args, CommandRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Windows,
    MacOs,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => Self::Linux,
            "windows" => Self::Windows,
            "macos" => Self::MacOs,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BluetoothDevice {
    pub address: String,
    pub name: String,
}

pub struct BluetoothPush {
    config: BluetoothConfig,
    runner: Arc<dyn CommandRunner>,
    platform: Platform,
    connected: Option<String>,
}

impl BluetoothPush {
    pub fn new(config: BluetoothConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            runner,
            platform: Platform::current(),
            connected: None,
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn connected_device(&self) -> Option<&str> {
        self.connected.as_deref()
    }

    /// List devices known to the OS Bluetooth stack.
    pub async fn list_devices(&self) -> Result<Vec<BluetoothDevice>, SetupError> {
        let (program, argv) = match self.platform {
            Platform::Linux => ("bluetoothctl", args(["devices"])),
            Platform::Windows => (
                "powershell",
                args(["-Command", "Get-PnpDevice -Class Bluetooth | Format-List FriendlyName,InstanceId"]),
            ),
            Platform::MacOs => ("system_profiler", args(["SPBluetoothDataType"])),
            Platform::Other => {
                return Err(SetupError::Transport(format!(
                    "Bluetooth is not supported on {}",
                    std::env::consts::OS
                )))
            }
        };

        info!("Listing Bluetooth devices...");
        let output = self
            .runner
            .run(program, &argv, None)
            .await
            .map_err(|e| SetupError::Transport(format!("{program}: {e}")))?;
        if !output.success() {
            return Err(SetupError::Transport(format!(
                "{program}: {}",
                output.failure_detail()
            )));
        }

        let devices = parse_devices(&output.stdout);
        debug!("Found {} Bluetooth devices", devices.len());
        Ok(devices)
    }

    async fn connect(&self, address: &str) -> Result<(), SetupError> {
        info!("Connecting to Bluetooth device {address}...");
        let (program, argv) = match self.platform {
            Platform::Linux => ("bluetoothctl", args(["connect", address])),
            Platform::Windows => (
                "powershell",
                args([
                    "-Command".to_string(),
                    format!(
                        "Add-Type -AssemblyName System.Runtime.WindowsRuntime; \
                         $op = [Windows.Devices.Bluetooth.BluetoothDevice]::FromBluetoothAddressAsync('{address}'); \
                         $device = $op.AsTask().GetAwaiter().GetResult(); $device.DeviceId"
                    ),
                ]),
            ),
            Platform::MacOs => ("BluetoothConnector", args([address, "--connect"])),
            Platform::Other => return Err(SetupError::ConnectRefused(address.to_string())),
        };

        let output = self.runner.run(program, &argv, None).await.map_err(|e| {
            warn!("Cannot run {program}: {e}");
            SetupError::ConnectRefused(address.to_string())
        })?;

        // bluetoothctl exits 0 even when the connection fails
        let connected = match self.platform {
            Platform::Linux => output.stdout.contains("Connection successful"),
            _ => output.success(),
        };
        if !connected {
            warn!("Bluetooth connect failed: {}", output.failure_detail());
            return Err(SetupError::ConnectRefused(address.to_string()));
        }

        info!("Connected to Bluetooth device {address}");
        Ok(())
    }

    async fn play(&self, path: &Path) -> Result<PlaybackOutcome, PublishError> {
        if self.config.use_audio_stack {
            let owned = path.to_path_buf();
            match tokio::task::spawn_blocking(move || play_with_rodio(&owned)).await {
                Ok(Ok(())) => return Ok(PlaybackOutcome::Success),
                Ok(Err(e)) => warn!("Audio stack playback failed: {e}, falling back to players"),
                Err(e) => warn!("Audio playback task failed: {e}, falling back to players"),
            }
        }

        let mut last_failure = None;
        for player in &self.config.players {
            let argv = vec![path.to_string_lossy().into_owned()];
            match self.runner.run(player, &argv, None).await {
                Ok(output) if output.success() => {
                    debug!("Played via {player}");
                    return Ok(PlaybackOutcome::Success);
                }
                Ok(output) => {
                    warn!("{player} failed: {}", output.failure_detail());
                    last_failure = Some(PlaybackOutcome::Failure {
                        code: output.code.unwrap_or(-1),
                        reason: format!("{player}: {}", output.failure_detail()),
                    });
                }
                Err(e) => debug!("{player} unavailable: {e}"),
            }
        }

        last_failure.ok_or_else(|| {
            PublishError::step(
                "play",
                format!("no audio player could be started (tried {})", self.config.players.join(", ")),
            )
        })
    }
}

#[async_trait]
impl Transport for BluetoothPush {
    fn backend(&self) -> Backend {
        Backend::BluetoothPush
    }

    fn requires_remote_device(&self) -> bool {
        false
    }

    async fn prepare(&mut self) -> Result<(), SetupError> {
        if self.connected.is_some() {
            return Ok(());
        }

        let address = match self.config.device.clone() {
            Some(address) => address,
            None => {
                info!("No Bluetooth device configured, listing available devices");
                let devices = self.list_devices().await?;
                for device in &devices {
                    info!("  {} {}", device.address, device.name);
                }
                devices
                    .into_iter()
                    .next()
                    .map(|d| d.address)
                    .ok_or_else(|| SetupError::DeviceNotFound("bluetooth".into()))?
            }
        };

        self.connect(&address).await?;
        self.connected = Some(address);
        Ok(())
    }

    async fn publish(&mut self, artifact: &Artifact) -> Result<PublishResult, PublishError> {
        let Some(device) = &self.connected else {
            return Err(PublishError::Unavailable("no Bluetooth device connected".into()));
        };

        info!("Playing {} via Bluetooth device {device}", artifact.file_name());
        let outcome = self.play(&artifact.local_path).await?;

        Ok(PublishResult {
            address: artifact.local_path.to_string_lossy().into_owned(),
            backend: Backend::BluetoothPush,
            published_at: chrono::Local::now(),
            local_outcome: Some(outcome),
        })
    }

    async fn shutdown(&mut self) {
        if let Some(address) = self.connected.take() {
            debug!("Leaving Bluetooth device {address} connected for the OS");
        }
    }
}

fn play_with_rodio(path: &Path) -> Result<(), String> {
    let stream = rodio::OutputStreamBuilder::open_default_stream()
        .map_err(|e| format!("Failed to open audio output: {e}"))?;
    let file = std::fs::File::open(path).map_err(|e| format!("Failed to open {}: {e}", path.display()))?;
    let source = rodio::Decoder::new(BufReader::new(file))
        .map_err(|e| format!("Failed to decode {}: {e}", path.display()))?;

    let sink = rodio::Sink::connect_new(stream.mixer());
    sink.append(source);
    sink.sleep_until_end();
    Ok(())
}

fn mac_regex() -> &'static Regex {
    static MAC: OnceLock<Regex> = OnceLock::new();
    MAC.get_or_init(|| {
        Regex::new(r"(?i)\b([0-9a-f]{2}(?:[:-][0-9a-f]{2}){5})\b").expect("valid MAC regex")
    })
}

/// Extract `address name` pairs from any of the platform listings.
fn parse_devices(listing: &str) -> Vec<BluetoothDevice> {
    let mut devices: Vec<BluetoothDevice> = Vec::new();
    for line in listing.lines() {
        let Some(m) = mac_regex().find(line) else {
            continue;
        };
        let address = m.as_str().replace('-', ":").to_uppercase();
        if devices.iter().any(|d| d.address == address) {
            continue;
        }
        let name = line[m.end()..]
            .trim_matches(|c: char| c.is_whitespace() || c == ':')
            .to_string();
        devices.push(BluetoothDevice { address, name });
    }
    devices
}
