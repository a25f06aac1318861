//! voice-relay: speaks chatbot replies through a robot, a Bluetooth speaker,
//! or a CDN-hosted audio file.

mod artifact;
mod chat;
mod config;
mod delivery;
mod device;
mod error;
mod history;
mod input;
mod playback;
mod process;
mod session;
mod speech;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::artifact::LocalArtifactStore;
use crate::config::Config;
use crate::delivery::{DeliveryOrchestrator, RetryPolicy};
use crate::device::{BridgeDevice, RemoteDevice};
use crate::history::DeliveryHistory;
use crate::playback::PlaybackCommander;
use crate::process::{CommandRunner, SystemRunner};
use crate::session::SessionLoop;
use crate::transport::bluetooth::BluetoothPush;
use crate::transport::{build_transport, Backend};

#[derive(Parser, Debug)]
#[command(name = "voice-relay", about = "Deliver spoken chatbot replies to a playback device")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Transport backend (overrides config)
    #[arg(short, long, value_enum)]
    transport: Option<Backend>,

    /// Bluetooth device MAC address (overrides config)
    #[arg(short, long)]
    device: Option<String>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive conversation (default)
    Chat {
        /// Speak each input line as-is instead of asking the chat model
        #[arg(long)]
        echo: bool,
    },
    /// Deliver one fixed text and exit
    Say { text: String },
    /// List reachable robots and known Bluetooth devices
    Devices,
    /// Print the delivery report for a day
    Report {
        /// Date as YYYY-MM-DD
        #[arg(long, default_value = "today")]
        date: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug,hyper=info,reqwest=info")
    } else {
        EnvFilter::new("info,hyper=warn,reqwest=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    for env_file in ["keys.env", ".env"] {
        if dotenvy::from_filename(env_file).is_ok() {
            info!("Loaded environment from {env_file}");
        }
    }

    let mut config = Config::load(args.config.as_deref());
    if let Some(backend) = args.transport {
        config.transport = backend;
    }
    if let Some(mac) = args.device {
        config.bluetooth.device = Some(mac);
    }

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);

    match args.command.unwrap_or(Command::Chat { echo: false }) {
        Command::Report { date } => {
            let history = DeliveryHistory::in_home().ok_or("no home directory for history")?;
            println!("{}", history.report(&date));
            if history.load(&date).is_empty() {
                let dates = history.dates();
                if !dates.is_empty() {
                    println!("\nAvailable dates: {}", dates.join(", "));
                }
            }
        }
        Command::Devices => list_devices(&config, runner).await,
        Command::Say { text } => {
            let mut session = build_session(&config, runner);
            if !session.say(&text).await? {
                return Err("delivery failed".into());
            }
        }
        Command::Chat { echo } => {
            let mut session = build_session(&config, runner);
            if !echo {
                let chat = chat::GeminiChat::from_env(config.chat.clone())?;
                session = session.with_chat(Box::new(chat));
            }

            let token = CancellationToken::new();
            tokio::spawn({
                let token = token.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_err() {
                        return;
                    }
                    token.cancel();
                    // the handler stays installed, so a second Ctrl+C has to exit explicitly
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Interrupted again, exiting without teardown");
                        std::process::exit(130);
                    }
                }
            });
            session = session.with_shutdown(token);

            info!(
                "Type a message and press Enter ({} to quit)",
                config.session.stop_words.join(" / ")
            );
            let summary = session.run(BufReader::new(input::stdin_reader())).await?;
            info!("Goodbye ({} turn(s))", summary.turns);
        }
    }

    Ok(())
}

fn build_session(config: &Config, runner: Arc<dyn CommandRunner>) -> SessionLoop {
    let store = Arc::new(LocalArtifactStore::new(&config.artifacts));
    let fallback = config
        .session
        .fallback_transport
        .filter(|backend| *backend != config.transport)
        .map(|backend| build_transport(backend, config, runner.clone()));
    let transport = build_transport(config.transport, config, runner);
    let device: Arc<dyn RemoteDevice> = Arc::new(BridgeDevice::new(&config.robot));

    let delivery = DeliveryOrchestrator::new(
        store,
        transport,
        PlaybackCommander::new(Some(device.clone()), config.robot.volume),
        RetryPolicy::from(&config.delivery),
    );
    let history = if config.history.enabled {
        DeliveryHistory::in_home()
    } else {
        None
    };

    let mut session = SessionLoop::new(
        config.session.clone(),
        delivery,
        Arc::new(speech::TranslateTts::new(config.speech.clone())),
    )
    .with_device(device, &config.robot)
    .with_history(history)
    .with_fallback_reply(config.chat.fallback_reply.clone());
    if let Some(fallback) = fallback {
        session = session.with_fallback_transport(fallback);
    }
    session
}

async fn list_devices(config: &Config, runner: Arc<dyn CommandRunner>) {
    let bridge = BridgeDevice::new(&config.robot);
    let timeout = Duration::from_secs(config.robot.search_timeout_secs);
    info!("Searching for robots ({}s)...", timeout.as_secs());
    match bridge.list(timeout).await {
        Ok(robots) if robots.is_empty() => println!("No robots found"),
        Ok(robots) => {
            println!("Robots:");
            for robot in robots {
                println!("  {} ({}:{})", robot.name, robot.address, robot.port);
            }
        }
        Err(e) => warn!("Robot search failed: {e}"),
    }

    match BluetoothPush::new(config.bluetooth.clone(), runner).list_devices().await {
        Ok(devices) if devices.is_empty() => println!("No Bluetooth devices found"),
        Ok(devices) => {
            println!("Bluetooth devices:");
            for device in devices {
                println!("  {} {}", device.address, device.name);
            }
        }
        Err(e) => warn!("Bluetooth enumeration failed: {e}"),
    }
}
