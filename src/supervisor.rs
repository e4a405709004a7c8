//! Per-device supervisor: owns the Session, the Catalog, and (across
//! reconnects) the command channel from the MQTT bridge. Reconnects on any
//! transport failure or clean close, publishing liveness as it goes.
//!
//! Ported from `hc2mqtt.py`'s `client_connect` (3s pre-connect delay, 57s
//! post-failure delay, fresh `HCSocket`/`HCDevice` per iteration).

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use crate::bridge::{DeviceEvent, DeviceEventKind, OutgoingCommand};
use crate::catalog::Catalog;
use crate::config::DeviceConfig;
use crate::error::HcError;
use crate::session::{Action, Session, SessionEvent};
use crate::transport::{Transport, PING_INTERVAL, PONG_TIMEOUT};

const PRE_CONNECT_DELAY: Duration = Duration::from_secs(3);
const POST_FAILURE_DELAY: Duration = Duration::from_secs(57);

pub async fn run_device(
    device: DeviceConfig,
    domain_suffix: String,
    mut commands_rx: mpsc::UnboundedReceiver<OutgoingCommand>,
    events_tx: mpsc::UnboundedSender<DeviceEvent>,
) {
    let mut catalog = Catalog::from_device(&device);

    let seeded = catalog.initial_state();
    if !seeded.is_empty() {
        let _ = events_tx.send(DeviceEvent {
            device: device.name.clone(),
            kind: DeviceEventKind::StateUpdate(seeded),
        });
    }

    loop {
        tokio::time::sleep(PRE_CONNECT_DELAY).await;

        tracing::info!(device = %device.name, host = %device.host, "connecting");
        match connect_and_run(&device, &domain_suffix, &mut catalog, &mut commands_rx, &events_tx).await
        {
            Ok(()) => tracing::info!(device = %device.name, "connection closed"),
            Err(e) => tracing::error!(device = %device.name, error = %e, "connection failed"),
        }

        let _ = events_tx.send(DeviceEvent { device: device.name.clone(), kind: DeviceEventKind::Offline });
        tokio::time::sleep(POST_FAILURE_DELAY).await;
    }
}

async fn connect_and_run(
    device: &DeviceConfig,
    domain_suffix: &str,
    catalog: &mut Catalog,
    commands_rx: &mut mpsc::UnboundedReceiver<OutgoingCommand>,
    events_tx: &mpsc::UnboundedSender<DeviceEvent>,
) -> Result<(), HcError> {
    let mut transport = Transport::connect(device, domain_suffix).await?;
    let _ = events_tx.send(DeviceEvent { device: device.name.clone(), kind: DeviceEventKind::Online });

    let mut session = Session::new(device.name.clone());
    session.connected = true;

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            frame = transport.recv_json() => {
                let frame = match frame? {
                    Some(frame) => frame,
                    None => {
                        session.connected = false;
                        return Ok(());
                    }
                };

                let outcome = session.handle_message(catalog, &frame);

                if let Some(reply) = outcome.reply {
                    transport.send_json(&reply).await?;
                }

                for pending in outcome.pending {
                    match session.get(catalog, &pending.resource, pending.version, pending.action, pending.data) {
                        Ok(out_frame) => {
                            let result = transport.send_json(&out_frame).await;
                            session.bump_msg_id();
                            result?;
                        }
                        Err(e) => tracing::error!(device = %device.name, error = %e, "failed to build follow-up request"),
                    }
                }

                emit_event(device, events_tx, outcome.event);
            }

            _ = ping_interval.tick() => {
                transport.send_ping().await?;
                if transport.seconds_since_pong() > PING_INTERVAL + PONG_TIMEOUT {
                    return Err(HcError::Transport("pong timeout".into()));
                }
            }

            Some(command) = commands_rx.recv() => {
                if !session.connected {
                    tracing::error!(device = %device.name, "cannot send command, websocket not connected");
                    continue;
                }

                let (resource, data) = match command {
                    OutgoingCommand::Values(v) => ("/ro/values", v),
                    OutgoingCommand::ActiveProgram(v) => ("/ro/activeProgram", v),
                    OutgoingCommand::SelectedProgram(v) => ("/ro/selectedProgram", v),
                };

                match session.get(catalog, resource, None, Action::Post, Some(data)) {
                    Ok(out_frame) => {
                        let result = transport.send_json(&out_frame).await;
                        session.bump_msg_id();
                        result?;
                    }
                    Err(e) => tracing::error!(device = %device.name, error = %e, "command rejected"),
                }
            }
        }
    }
}

fn emit_event(
    device: &DeviceConfig,
    events_tx: &mpsc::UnboundedSender<DeviceEvent>,
    event: SessionEvent,
) {
    match event {
        SessionEvent::StateUpdate(values) if !values.is_empty() => {
            let _ = events_tx.send(DeviceEvent {
                device: device.name.clone(),
                kind: DeviceEventKind::StateUpdate(values),
            });
        }
        SessionEvent::StateUpdate(_) => {}
        SessionEvent::Info(value) => {
            tracing::info!(device = %device.name, info = %value, "device info");
        }
        SessionEvent::Protocol { code, resource } => {
            tracing::warn!(device = %device.name, code, %resource, "appliance reported protocol error");
            let mut map: HashMap<String, serde_json::Value> = HashMap::new();
            map.insert("error".to_string(), json!(code));
            map.insert("resource".to_string(), json!(resource));
            let _ = events_tx.send(DeviceEvent {
                device: device.name.clone(),
                kind: DeviceEventKind::StateUpdate(map),
            });
        }
        SessionEvent::None => {}
    }
}
