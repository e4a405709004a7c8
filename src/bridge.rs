//! MQTT-facing half of the bridge: topic routing, command delivery to
//! device sessions, and diffed state/event publication.
//!
//! Ported from `hc2mqtt.py` (`on_connect`, `on_message`, `client_connect`'s
//! `on_message` closure).

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::{Args, DeviceConfig};

/// A validated-at-delivery command bound for one device's session.
#[derive(Debug, Clone)]
pub enum OutgoingCommand {
    Values(Value),
    ActiveProgram(Value),
    SelectedProgram(Value),
}

#[derive(Debug, Clone)]
pub enum DeviceEventKind {
    StateUpdate(HashMap<String, Value>),
    Online,
    Offline,
}

#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub device: String,
    pub kind: DeviceEventKind,
}

const FORCE_PUBLISH_KEY: &str = "BSH.Common.Status.ProgramSessionSummary.Latest";

/// Lowercase dotted feature name with `.` replaced by `_`, per spec.
fn feature_id(name: &str) -> String {
    name.to_ascii_lowercase().replace('.', "_")
}

pub struct Bridge {
    prefix: String,
    command_txs: HashMap<String, mpsc::UnboundedSender<OutgoingCommand>>,
    active_program_devices: HashSet<String>,
    last_state: HashMap<String, HashMap<String, Value>>,
}

impl Bridge {
    pub fn new(
        prefix: String,
        command_txs: HashMap<String, mpsc::UnboundedSender<OutgoingCommand>>,
        active_program_devices: HashSet<String>,
    ) -> Self {
        Bridge { prefix, command_txs, active_program_devices, last_state: HashMap::new() }
    }

    pub async fn run(
        mut self,
        args: Args,
        devices: Vec<DeviceConfig>,
        mut events_rx: mpsc::UnboundedReceiver<DeviceEvent>,
    ) -> anyhow::Result<()> {
        let lwt_topic = format!("{}LWT", self.prefix);

        let mut mqtt_options = MqttOptions::new(args.mqtt_clientname.clone(), args.mqtt_host.clone(), args.mqtt_port);
        mqtt_options.set_keep_alive(Duration::from_secs(70));
        if let (Some(user), Some(pass)) = (&args.mqtt_username, &args.mqtt_password) {
            mqtt_options.set_credentials(user.clone(), pass.clone());
        }
        mqtt_options.set_last_will(LastWill::new(lwt_topic.clone(), "offline", QoS::AtMostOnce, true));

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 256);

        client.publish(&lwt_topic, QoS::AtMostOnce, true, "online").await?;

        for device in &devices {
            let set_topic = format!("{}{}/set", self.prefix, device.name);
            tracing::info!(device = %device.name, topic = %set_topic, "subscribing");
            client.subscribe(&set_topic, QoS::AtMostOnce).await?;

            let selected_topic = format!("{}{}/selectedProgram", self.prefix, device.name);
            client.subscribe(&selected_topic, QoS::AtMostOnce).await?;

            if self.active_program_devices.contains(&device.name) {
                let active_topic = format!("{}{}/activeProgram", self.prefix, device.name);
                tracing::info!(device = %device.name, topic = %active_topic, "subscribing");
                client.subscribe(&active_topic, QoS::AtMostOnce).await?;
            }
        }

        loop {
            tokio::select! {
                incoming = eventloop.poll() => {
                    match incoming {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            self.handle_incoming(&publish.topic, &publish.payload);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "mqtt event loop error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                Some(event) = events_rx.recv() => {
                    self.handle_device_event(&client, event).await;
                }
            }
        }
    }

    fn handle_incoming(&self, topic: &str, payload: &[u8]) {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() < 2 {
            tracing::error!(%topic, "invalid mqtt topic");
            return;
        }
        let device_name = parts[parts.len() - 2];
        let command_kind = parts[parts.len() - 1];

        let parsed: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(%topic, error = %e, "invalid JSON in mqtt payload");
                return;
            }
        };

        let command = match command_kind {
            "set" => OutgoingCommand::Values(parsed),
            "activeProgram" => OutgoingCommand::ActiveProgram(parsed),
            "selectedProgram" => OutgoingCommand::SelectedProgram(parsed),
            other => {
                tracing::error!(%topic, topic_kind = other, "payload topic is unknown");
                return;
            }
        };

        match self.command_txs.get(device_name) {
            Some(tx) => {
                if tx.send(command).is_err() {
                    tracing::error!(device = device_name, "device supervisor task is gone");
                }
            }
            None => tracing::error!(device = device_name, "no such device configured"),
        }
    }

    async fn handle_device_event(&mut self, client: &AsyncClient, event: DeviceEvent) {
        let device_topic = format!("{}{}", self.prefix, event.device);

        match event.kind {
            DeviceEventKind::Online => {
                let _ = client.publish(format!("{device_topic}/LWT"), QoS::AtMostOnce, true, "online").await;
            }
            DeviceEventKind::Offline => {
                let _ = client.publish(format!("{device_topic}/LWT"), QoS::AtMostOnce, true, "offline").await;
            }
            DeviceEventKind::StateUpdate(values) => {
                let stored = self.last_state.entry(event.device.clone()).or_default();

                for (key, value) in values {
                    let is_event = key.contains(".Event.");

                    if !is_event {
                        let force = key == FORCE_PUBLISH_KEY;
                        let previously_seen = stored.contains_key(&key);
                        if !previously_seen && value == Value::Null {
                            continue;
                        }
                        let changed = stored.get(&key) != Some(&value);
                        if !force && !changed {
                            continue;
                        }
                        stored.insert(key.clone(), value.clone());
                    }

                    let id = feature_id(&key);
                    let (subtree, body) = if is_event {
                        ("event", serde_json::json!({"event_type": value}))
                    } else {
                        ("state", value)
                    };

                    let topic = format!("{device_topic}/{subtree}/{id}");
                    let payload = serde_json::to_string(&body).unwrap_or_default();
                    if let Err(e) = client.publish(&topic, QoS::AtMostOnce, true, payload).await {
                        metrics::counter!("hc.bridge.publish_err").increment(1);
                        tracing::error!(%topic, error = %e, "mqtt publish failed");
                    } else {
                        metrics::counter!("hc.bridge.publish_ok").increment(1);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_id_lowercases_and_replaces_dots() {
        assert_eq!(feature_id("BSH.Common.Status.DoorState"), "bsh_common_status_doorstate");
    }
}
