// packages/gattlink_cli/src/main.rs
//! Command-line driver for gattlink
//!
//! `demo` runs a full session against a simulated battery peripheral:
//! connect, discover, auto-subscribe, read, receive a few notifications,
//! then release. `config` prints or validates a session configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use gattlink::ble::gatt::{BATTERY_ID, BATTERY_LEVEL_UUID};
use gattlink::ble::simulated::SimPeripheral;
use gattlink::{ApplicationCharacteristic, BleDevice, GattConfig, NoHooks};

#[derive(Parser)]
#[command(name = "gattlink", version, about = "BLE GATT session engine driver")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a session against a simulated battery peripheral
    Demo {
        /// Peripheral display name
        #[arg(long, default_value = "Sim Battery")]
        name: String,
        /// JSON session configuration
        #[arg(long)]
        config: Option<PathBuf>,
        /// Number of notifications to push through the link
        #[arg(long, default_value_t = 3)]
        notifications: u8,
        /// MTU to negotiate once services are discovered
        #[arg(long)]
        mtu: Option<u16>,
    },
    /// Print the default configuration, or validate a file
    Config {
        /// File to validate
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<GattConfig> {
    match path {
        Some(path) => GattConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(GattConfig::default()),
    }
}

async fn run_demo(
    name: String,
    config: Option<PathBuf>,
    notifications: u8,
    mtu: Option<u16>,
) -> Result<()> {
    let mut config = load_config(config.as_ref())?;
    if mtu.is_some() {
        config.desired_mtu = mtu;
    }

    let (sim, events) = SimPeripheral::battery(&name);
    let device = BleDevice::new(
        vec![ApplicationCharacteristic::battery()],
        config,
        Arc::new(NoHooks),
    )?;
    device.on_disconnected(|address| info!("{} disconnected", address));

    device.connect(Arc::new(sim.clone()), events).await?;
    device.wait_until_ready().await?;
    println!("Connected: {}", device.state());
    println!("MTU: {}", device.mtu());

    let level = device.read(BATTERY_ID, None).await?;
    println!("{}", level);

    let Some(handle) = sim.handle_of(BATTERY_LEVEL_UUID) else {
        bail!("simulated peripheral has no battery level characteristic");
    };
    let mut stream = device.notifications()?;
    for step in 0..notifications {
        sim.notify(handle, vec![80u8.saturating_sub(step)]);
        match tokio::time::timeout(Duration::from_secs(1), stream.recv()).await {
            Ok(Ok(notification)) => println!(
                "Notification #{}: {:?}",
                notification.characteristic.id, notification.value
            ),
            Ok(Err(e)) => warn!("notification stream: {}", e),
            Err(_) => warn!("no notification within 1s"),
        }
    }

    let rssi = device.request_rssi(None).await?;
    println!("{}", rssi);

    device.release().await;
    println!("Released: {}", device.state());
    Ok(())
}

fn run_config(file: Option<PathBuf>) -> Result<()> {
    let config = load_config(file.as_ref())?;
    if let Some(path) = file {
        println!("{} is valid", path.display());
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Demo {
            name,
            config,
            notifications,
            mtu,
        } => {
            tokio::select! {
                result = run_demo(name, config, notifications, mtu) => result,
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupted");
                    Ok(())
                }
            }
        }
        Command::Config { file } => run_config(file),
    }
}
