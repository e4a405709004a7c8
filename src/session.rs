//! Appliance session state machine: handshake, service discovery, and the
//! steady-state POST/RESPONSE/NOTIFY exchange.
//!
//! Ported from `HCDevice.py` (`handle_message`, `get`, `reconnect`). States
//! `Init -> AwaitInitialValues -> ServicesHandshake -> Running -> Closed`
//! are not modeled as an explicit enum beyond `services_initialized`: the
//! transitions described in the spec are entirely driven by which inbound
//! frame arrives, matching the original's reactive structure.

use std::collections::HashMap;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::Catalog;
use crate::error::HcError;

pub const DEVICE_TYPE: &str = "Application";
pub const DEVICE_NAME: &str = "hcpy";
pub const DEVICE_ID: &str = "0badcafe";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "RESPONSE")]
    Response,
    #[serde(rename = "NOTIFY")]
    Notify,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "sID", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<i64>,
    #[serde(rename = "msgID")]
    pub msg_id: i64,
    pub resource: String,
    pub version: i64,
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

/// A GET/POST/NOTIFY this session wants issued next; built into a `Frame`
/// (with validation and `txMsgID` assignment) by `Session::get`.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub resource: String,
    pub version: Option<i64>,
    pub action: Action,
    pub data: Option<Value>,
}

fn req(resource: &str, action: Action) -> PendingRequest {
    PendingRequest { resource: resource.to_string(), version: None, action, data: None }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateUpdate(HashMap<String, Value>),
    Info(Value),
    Protocol { code: i64, resource: String },
    None,
}

/// Result of processing one inbound frame: an event to publish upward, an
/// optional direct RESPONSE (echoing the peer's own `msgID`, outside the
/// `txMsgID` sequence), and any follow-up requests to issue through `get`.
pub struct HandleOutcome {
    pub event: SessionEvent,
    pub reply: Option<Frame>,
    pub pending: Vec<PendingRequest>,
}

impl HandleOutcome {
    fn event_only(event: SessionEvent) -> Self {
        HandleOutcome { event, reply: None, pending: Vec::new() }
    }
}

pub struct Session {
    pub name: String,
    pub session_id: Option<i64>,
    pub tx_msg_id: i64,
    pub services: HashMap<String, i64>,
    pub services_initialized: bool,
    pub token: Option<String>,
    pub connected: bool,
}

impl Session {
    pub fn new(name: String) -> Self {
        Session {
            name,
            session_id: None,
            tx_msg_id: 0,
            services: HashMap::new(),
            services_initialized: false,
            token: None,
            connected: false,
        }
    }

    /// Build the outbound frame for a `get(resource, version, action,
    /// data)` call: resolve a default version from the resource's service
    /// prefix, validate POST bodies against the catalog, and stamp the
    /// current `txMsgID`. The caller transmits the frame and then calls
    /// `bump_msg_id` exactly once, regardless of whether the send
    /// succeeded.
    pub fn get(
        &self,
        catalog: &Catalog,
        resource: &str,
        version: Option<i64>,
        action: Action,
        data: Option<Value>,
    ) -> Result<Frame, HcError> {
        let version = version.unwrap_or_else(|| {
            if !self.services_initialized {
                return 1;
            }
            resource
                .splitn(3, '/')
                .nth(1)
                .and_then(|prefix| self.services.get(prefix))
                .copied()
                .unwrap_or(1)
        });

        let mut data_vec: Option<Vec<Value>> = data.map(|d| match d {
            Value::Array(items) => items,
            other => vec![other],
        });

        if action == Action::Post {
            if let Some(items) = &mut data_vec {
                match resource {
                    "/ro/values" => {
                        for item in items.iter_mut() {
                            catalog.validate_write(item)?;
                        }
                    }
                    "/ro/activeProgram" | "/ro/selectedProgram" => {
                        for item in items.iter_mut() {
                            catalog.validate_program(item)?;
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(Frame {
            session_id: self.session_id,
            msg_id: self.tx_msg_id,
            resource: resource.to_string(),
            version,
            action,
            data: data_vec,
            code: None,
        })
    }

    pub fn bump_msg_id(&mut self) {
        self.tx_msg_id += 1;
    }

    fn reply_to(&self, incoming: &Frame, data: Value) -> Frame {
        Frame {
            session_id: incoming.session_id,
            msg_id: incoming.msg_id,
            resource: incoming.resource.clone(),
            version: incoming.version,
            action: Action::Response,
            data: Some(vec![data]),
            code: None,
        }
    }

    /// Process one inbound frame, mutating catalog state as needed and
    /// returning whatever reply/follow-up requests/events result.
    pub fn handle_message(&mut self, catalog: &mut Catalog, frame: &Frame) -> HandleOutcome {
        if let Some(code) = frame.code {
            return HandleOutcome::event_only(SessionEvent::Protocol {
                code,
                resource: frame.resource.clone(),
            });
        }

        match frame.action {
            Action::Post => {
                if frame.resource == "/ei/initialValues" {
                    let Some(data) = &frame.data else {
                        return HandleOutcome::event_only(SessionEvent::None);
                    };
                    let Some(first) = data.first() else {
                        return HandleOutcome::event_only(SessionEvent::None);
                    };
                    self.session_id = frame.session_id;
                    self.tx_msg_id = first.get("edMsgID").and_then(|v| v.as_i64()).unwrap_or(0);

                    let reply = self.reply_to(
                        frame,
                        serde_json::json!({
                            "deviceType": DEVICE_TYPE,
                            "deviceName": DEVICE_NAME,
                            "deviceID": DEVICE_ID,
                        }),
                    );

                    HandleOutcome {
                        event: SessionEvent::None,
                        reply: Some(reply),
                        pending: vec![{
                            let mut r = req("/ci/services", Action::Get);
                            r.version = Some(1);
                            r
                        }],
                    }
                } else {
                    tracing::info!(resource = %frame.resource, "unknown POST resource, ignoring");
                    HandleOutcome::event_only(SessionEvent::None)
                }
            }

            Action::Response | Action::Notify => self.handle_response_or_notify(catalog, frame),

            Action::Get => HandleOutcome::event_only(SessionEvent::None),
        }
    }

    fn handle_response_or_notify(&mut self, catalog: &mut Catalog, frame: &Frame) -> HandleOutcome {
        let data = frame.data.clone().unwrap_or_default();

        match frame.resource.as_str() {
            "/ro/values" | "/ro/allMandatoryValues" => {
                HandleOutcome::event_only(SessionEvent::StateUpdate(catalog.parse_values(&data)))
            }

            "/ro/descriptionChange" | "/ro/allDescriptionChanges" => {
                for change in &data {
                    catalog.apply_description_change(change);
                }
                let values = catalog.parse_values(&data);
                HandleOutcome::event_only(SessionEvent::StateUpdate(values))
            }

            "/iz/info" | "/ci/info" | "/ni/info" => match data.first() {
                Some(first) => HandleOutcome::event_only(SessionEvent::Info(first.clone())),
                None => HandleOutcome::event_only(SessionEvent::None),
            },

            "/ci/services" => {
                let first_time = !self.services_initialized;
                for service in &data {
                    let (Some(name), Some(version)) = (
                        service.get("service").and_then(|v| v.as_str()),
                        service.get("version").and_then(|v| v.as_i64()),
                    ) else {
                        continue;
                    };
                    self.services.insert(name.to_string(), version);
                }
                self.services_initialized = true;

                let pending = if first_time { self.handshake_cascade() } else { Vec::new() };
                HandleOutcome { event: SessionEvent::None, reply: None, pending }
            }

            "/ci/authentication" => {
                if let Some(first) = data.first() {
                    self.token = first.get("response").and_then(|v| v.as_str()).map(String::from);
                }
                HandleOutcome::event_only(SessionEvent::None)
            }

            "/ci/registeredDevices" | "/ci/tzInfo" | "/ni/config" => {
                HandleOutcome::event_only(SessionEvent::None)
            }

            other => {
                tracing::debug!(resource = %other, "unknown response/notify resource");
                HandleOutcome::event_only(SessionEvent::None)
            }
        }
    }

    /// The fixed cascade of follow-up requests issued once `/ci/services`
    /// first resolves, per `HCDevice.reconnect`.
    fn handshake_cascade(&self) -> Vec<PendingRequest> {
        let mut pending = Vec::new();

        if self.services.get("ci").copied() == Some(2) {
            let mut token = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut token);
            let nonce = base64url_nopad(&token);
            pending.push(PendingRequest {
                resource: "/ci/authentication".to_string(),
                version: None,
                action: Action::Post,
                data: Some(serde_json::json!({"nonce": nonce})),
            });
            pending.push(req("/ci/info", Action::Get));
        }

        if self.services.contains_key("iz") {
            pending.push(req("/iz/info", Action::Get));
        }

        if self.services.contains_key("ei") {
            pending.push(req("/ei/deviceReady", Action::Notify));
        }

        if self.services.contains_key("ce") {
            pending.push(req("/ce/status", Action::Get));
        }

        if self.services.contains_key("ni") {
            pending.push(req("/ni/info", Action::Get));
        }

        if self.services.contains_key("ro") {
            pending.push(req("/ro/allMandatoryValues", Action::Get));
            pending.push(req("/ro/allDescriptionChanges", Action::Get));
        }

        pending
    }
}

fn base64url_nopad(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, DeviceDescription};
    use indexmap::IndexMap;

    fn empty_catalog() -> Catalog {
        let device = DeviceConfig {
            name: "washer".into(),
            host: "10.0.0.5".into(),
            key: "AAAA".into(),
            iv: None,
            description: DeviceDescription::default(),
            features: IndexMap::new(),
        };
        Catalog::from_device(&device)
    }

    #[test]
    fn s1_handshake() {
        let mut session = Session::new("washer".into());
        let mut catalog = empty_catalog();

        let incoming = Frame {
            session_id: Some(42),
            msg_id: 1,
            resource: "/ei/initialValues".into(),
            version: 1,
            action: Action::Post,
            data: Some(vec![serde_json::json!({"edMsgID": 1000})]),
            code: None,
        };

        let outcome = session.handle_message(&mut catalog, &incoming);
        let reply = outcome.reply.expect("expected a direct RESPONSE frame");
        assert_eq!(reply.session_id, Some(42));
        assert_eq!(reply.msg_id, 1);
        assert_eq!(
            reply.data.unwrap()[0],
            serde_json::json!({"deviceType": "Application", "deviceName": "hcpy", "deviceID": "0badcafe"})
        );

        assert_eq!(session.session_id, Some(42));
        assert_eq!(session.tx_msg_id, 1000);

        assert_eq!(outcome.pending.len(), 1);
        assert_eq!(outcome.pending[0].resource, "/ci/services");

        let next = session.get(&catalog, &outcome.pending[0].resource, outcome.pending[0].version, outcome.pending[0].action, None).unwrap();
        assert_eq!(next.msg_id, 1000);
        assert_eq!(next.version, 1);
    }

    #[test]
    fn s2_service_version_selection() {
        let mut session = Session::new("washer".into());
        session.session_id = Some(42);
        session.tx_msg_id = 1000;
        let mut catalog = empty_catalog();

        let services = Frame {
            session_id: Some(42),
            msg_id: 1000,
            resource: "/ci/services".into(),
            version: 1,
            action: Action::Response,
            data: Some(vec![
                serde_json::json!({"service": "ro", "version": 2}),
                serde_json::json!({"service": "ei", "version": 2}),
            ]),
            code: None,
        };
        let outcome = session.handle_message(&mut catalog, &services);
        assert!(outcome.pending.iter().any(|p| p.resource == "/ro/allMandatoryValues"));

        let frame = session.get(&catalog, "/ro/allMandatoryValues", None, Action::Get, None).unwrap();
        assert_eq!(frame.version, 2);
    }

    #[test]
    fn msg_id_increments_strictly() {
        let mut session = Session::new("washer".into());
        session.tx_msg_id = 5;
        let catalog = empty_catalog();
        let mut ids = Vec::new();
        for _ in 0..4 {
            let frame = session.get(&catalog, "/ro/values", None, Action::Get, None).unwrap();
            ids.push(frame.msg_id);
            session.bump_msg_id();
        }
        assert_eq!(ids, vec![5, 6, 7, 8]);
    }

    #[test]
    fn protocol_error_does_not_force_reconnect_it_only_emits() {
        let mut session = Session::new("washer".into());
        let mut catalog = empty_catalog();
        let frame = Frame {
            session_id: Some(1),
            msg_id: 1,
            resource: "/ro/values".into(),
            version: 1,
            action: Action::Response,
            data: None,
            code: Some(9),
        };
        let outcome = session.handle_message(&mut catalog, &frame);
        assert!(matches!(outcome.event, SessionEvent::Protocol { code: 9, .. }));
    }
}
