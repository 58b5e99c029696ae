//! midibus - MIDI network gateway
//!
//! Bridges UDP/IP multicast, the ALSA sequencer and JACK MIDI into one
//! virtual MIDI bus. Runs headless until SIGINT/SIGTERM:
//!
//! 1. Loads `~/.config/midibus/config.yaml` (or `--config`) and applies CLI overrides
//! 2. Opens the enabled transports, retrying every few seconds on failure
//! 3. Resets the bridge whenever a transport is lost (e.g. JACK server shutdown)
//!
//! Set `RUST_LOG=debug` (or `trace` for per-message logs) for verbose output.

mod args;
mod signals;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam::select;

use args::Args;
use midibus_core::config::{default_config_path, load_config, load_config_strict};
use midibus_core::{BridgeConfig, DeviceManager, ManagerEvent, MessageHandler, RETRY_INTERVAL};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load(args: &Args) -> Result<BridgeConfig> {
    let mut config: BridgeConfig = match &args.config {
        // An explicit path must exist and parse
        Some(path) => load_config_strict(path)?,
        None => load_config(&default_config_path()),
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn run(args: Args) -> Result<()> {
    log::info!("midibus {} starting up", VERSION);

    let signals = signals::spawn()?;
    let config = load(&args)?;
    log::info!(
        "{} port(s), group {}:{}, interface {}, transports: network={} alsa={} jack={}",
        config.num_ports,
        config.network.multicast_address,
        config.network.udp_port,
        config.network.interface().unwrap_or("(all)"),
        config.network_enabled,
        config.alsa_midi,
        config.jack_midi
    );

    let message_handler: MessageHandler = Arc::new(|title: &str, body: &str| {
        log::error!("{}: {}", title, body.replace("\n\n", " "));
    });
    let manager = DeviceManager::new(config, message_handler);
    let events = manager.events();

    if manager.reset().is_err() {
        log::warn!("Bridge not ready, retrying every {:?}", RETRY_INTERVAL);
    }

    loop {
        select! {
            recv(events) -> event => match event {
                Ok(ManagerEvent::DeviceLost(kind)) => {
                    log::warn!("{} was shut down, resetting the bridge", kind);
                    if manager.reset().is_err() {
                        log::warn!("Bridge not ready, retrying every {:?}", RETRY_INTERVAL);
                    }
                }
                Ok(ManagerEvent::Recovered) => log::info!("Bridge is up again"),
                Err(_) => break,
            },
            recv(signals) -> signal => {
                log::info!("Received signal {}, shutting down", signal.unwrap_or_default());
                break;
            }
        }
    }

    manager.close();
    log::info!("midibus stopped");
    Ok(())
}
