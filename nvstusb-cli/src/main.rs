// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Matthias Bilger <matthias@bilger.info>

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use log::{error, info, warn};
use nvstusb::{Emitter, EmitterEvent, FirmwareFile, LibUsbTransport, TransportError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(name = "nvstusb", version, about = "Drive a 3D Vision USB IR emitter")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log wire traffic and state changes
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the emitter and show what was found
    Connect {
        /// Only bind an already paired emitter
        #[arg(long)]
        reconnect_only: bool,
    },
    /// Upload firmware if the emitter has none
    Flash {
        /// Firmware image, overrides `firmware_path` from the config
        #[arg(short, long)]
        firmware: Option<PathBuf>,
    },
    /// Program the timers and toggle the eyes at the refresh rate
    Run {
        /// Refresh rate in Hz, overrides `refresh_rate` from the config
        #[arg(short, long)]
        rate: Option<f64>,
        /// Stop after this many frames
        #[arg(short, long)]
        frames: Option<u64>,
    },
    /// Print wheel and 3D button changes
    Keys,
}

type LibUsbEmitter = Emitter<LibUsbTransport>;

fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

async fn open_emitter(config: &Config) -> Result<Arc<LibUsbEmitter>> {
    let transport = Arc::new(
        LibUsbTransport::with_timeout(config.transfer_timeout())
            .context("Failed to initialise libusb")?,
    );
    let emitter = Arc::new(Emitter::new(transport.clone(), config.emitter_options()));

    emitter
        .register_callback(|event| match event {
            EmitterEvent::Connected => info!("Emitter connected"),
            EmitterEvent::Disconnected => warn!("Emitter disconnected"),
        })
        .await;

    match transport.watch_hotplug(config.identity()) {
        Ok(events) => {
            let watcher = emitter.clone();
            tokio::spawn(async move { watcher.watch(events).await });
        }
        Err(TransportError::HotplugUnsupported) => {
            warn!("Hot-plug is not supported, unplugging the emitter will not be noticed")
        }
        Err(e) => return Err(e).context("Failed to register for hot-plug events"),
    }

    Ok(emitter)
}

async fn connect(emitter: &LibUsbEmitter, reconnect_only: bool) -> Result<()> {
    emitter
        .connect(reconnect_only)
        .await
        .context("Failed to connect to emitter")?;
    if !emitter.is_connected().await {
        bail!("No paired emitter found");
    }
    Ok(())
}

async fn flash(emitter: &LibUsbEmitter, firmware: Option<PathBuf>) -> Result<bool> {
    if !emitter.firmware_check().await? {
        return Ok(false);
    }
    let path = firmware.context("Emitter needs firmware but no firmware_path is configured")?;
    let source = FirmwareFile::new(path);
    emitter
        .firmware_update(&source)
        .await
        .with_context(|| format!("Firmware upload from {:?} failed", source.path()))
}

async fn run(emitter: &LibUsbEmitter, rate: f64, frames: Option<u64>) -> Result<()> {
    emitter.initialize(rate).await?;
    emitter.reset_eye().await;

    // Stand-in for a vsync signal from the display.
    let mut ticker = interval(Duration::from_secs_f64(1.0 / rate));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut sent = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }
        if let Err(e) = emitter.toggle_eye(0.0).await {
            error!("Eye toggle failed: {}", e);
            break;
        }
        sent += 1;
        if frames.is_some_and(|limit| sent >= limit) {
            break;
        }
    }

    info!("Sent {} eye toggles", sent);
    Ok(())
}

async fn keys(emitter: &LibUsbEmitter) -> Result<()> {
    let mut ticker = interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
        let keys = emitter.read_keys().await?;
        if keys.wheel_delta != 0 || keys.pressed_wheel_delta != 0 || keys.toggled_3d {
            println!(
                "wheel {:+} pressed wheel {:+} 3D button {}",
                keys.wheel_delta,
                keys.pressed_wheel_delta,
                if keys.toggled_3d { "toggled" } else { "-" }
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_logging(&config, cli.verbose);

    let emitter = open_emitter(&config).await?;

    match cli.command {
        Command::Connect { reconnect_only } => {
            connect(&emitter, reconnect_only).await?;
            if let Some(session) = emitter.session().await {
                println!("Emitter at {}", session.device());
                match session.out_endpoint() {
                    Some(endpoint) => println!("OUT endpoint {}", endpoint),
                    None => println!("No OUT endpoint, firmware needs to be uploaded"),
                }
            }
        }
        Command::Flash { firmware } => {
            connect(&emitter, false).await?;
            if flash(&emitter, firmware.or(config.firmware_path.clone())).await? {
                println!("Firmware uploaded");
            } else {
                println!("Emitter already has firmware");
            }
        }
        Command::Run { rate, frames } => {
            connect(&emitter, false).await?;
            flash(&emitter, config.firmware_path.clone()).await?;
            run(&emitter, rate.unwrap_or(config.refresh_rate), frames).await?;
        }
        Command::Keys => {
            connect(&emitter, false).await?;
            keys(&emitter).await?;
        }
    }

    emitter.disconnect().await;
    Ok(())
}
