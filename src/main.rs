//! Entrypoint: load the device file, spawn one supervisor task per device,
//! and run the MQTT bridge until shutdown.

mod bridge;
mod catalog;
mod config;
mod crypto;
mod error;
mod session;
mod supervisor;
mod transport;

use std::collections::{HashMap, HashSet};

use clap::Parser;
use tokio::sync::mpsc;

use bridge::{Bridge, DeviceEvent, OutgoingCommand};
use config::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!(error = %e, "prometheus exporter failed to install");
    }

    let devices = config::load_devices(&args.devices_file)?;
    if devices.is_empty() {
        anyhow::bail!("no devices configured in {}", args.devices_file.display());
    }

    let mut command_txs = HashMap::new();
    let mut active_program_devices = HashSet::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel::<DeviceEvent>();

    for device in &devices {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<OutgoingCommand>();
        command_txs.insert(device.name.clone(), cmd_tx);

        let has_active_program = device
            .features
            .values()
            .any(|f| f.name.as_deref() == Some("BSH.Common.Root.ActiveProgram"));
        if has_active_program {
            active_program_devices.insert(device.name.clone());
        }

        let device = device.clone();
        let domain_suffix = args.domain_suffix.clone();
        let events_tx = events_tx.clone();
        tokio::spawn(async move {
            supervisor::run_device(device, domain_suffix, cmd_rx, events_tx).await;
        });
    }
    drop(events_tx);

    let bridge = Bridge::new(args.mqtt_prefix.clone(), command_txs, active_program_devices);

    tokio::select! {
        result = bridge.run(args, devices, events_rx) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down on ctrl-c");
            Ok(())
        }
    }
}
