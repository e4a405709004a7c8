//! Feature catalog: per-device mapping from numeric UID to feature
//! metadata, with lookup, description-change merging, write/program
//! validation, and inbound value decoding.
//!
//! Ported from `HCDevice.py` (`get_feature_uid`, `get_feature_name`,
//! `parse_values`, `test_feature`, `test_program_data`).

use std::collections::HashMap;

use indexmap::IndexMap;
use serde_json::{json, Value};

use crate::config::{DeviceConfig, FeatureRaw};
use crate::error::HcError;

/// Enumerated `values` map for a feature, pre-computed both directions so
/// program-name round-trips (UID → display string → UID) are O(1).
#[derive(Debug, Clone)]
pub struct EnumValues {
    pub by_index: HashMap<String, String>,
    pub by_display: HashMap<String, String>,
}

impl EnumValues {
    fn from_raw(raw: &HashMap<String, String>) -> Self {
        let mut by_display = HashMap::with_capacity(raw.len());
        for (k, v) in raw {
            by_display.insert(v.clone(), k.clone());
        }
        EnumValues { by_index: raw.clone(), by_display }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Feature {
    pub name: Option<String>,
    pub access: Option<String>,
    pub available: Option<bool>,
    pub ref_cid: Option<String>,
    pub ref_did: Option<String>,
    pub values: Option<EnumValues>,
    pub init_value: Option<String>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub step_size: Option<i64>,
    pub handling: Option<String>,
}

impl From<&FeatureRaw> for Feature {
    fn from(raw: &FeatureRaw) -> Self {
        Feature {
            name: raw.name.clone(),
            access: raw.access.clone(),
            available: raw.available,
            ref_cid: raw.ref_cid.clone(),
            ref_did: raw.ref_did.clone(),
            values: raw.values.as_ref().map(EnumValues::from_raw),
            init_value: raw.init_value.clone(),
            min: raw.min,
            max: raw.max,
            step_size: raw.step_size,
            handling: raw.handling.clone(),
        }
    }
}

/// The per-device feature catalog. Shared behind a single reader/writer
/// lock: the session task merges description changes and decodes values,
/// the bridge task validates outbound writes.
pub struct Catalog {
    features: IndexMap<String, Feature>,
}

fn is_boolish(raw: Option<&str>, ref_cid: Option<&str>, ref_did: Option<&str>) -> bool {
    let _ = raw;
    ref_cid == Some("01") && ref_did == Some("00")
}

fn json_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

impl Catalog {
    pub fn from_device(device: &DeviceConfig) -> Self {
        let mut features = IndexMap::with_capacity(device.features.len());
        for (uid, raw) in &device.features {
            features.insert(uid.clone(), Feature::from(raw));
        }
        Catalog { features }
    }

    pub fn resolve(&self, uid: &str) -> Option<&Feature> {
        self.features.get(uid)
    }

    pub fn resolve_name(&self, uid: &str) -> Option<String> {
        self.features.get(uid).and_then(|f| f.name.clone())
    }

    /// First match, in insertion (i.e. `devices.json` key) order, of a
    /// feature whose `name` contains `substring`.
    pub fn find_uid_by_name(&self, substring: &str) -> Option<String> {
        for (uid, feature) in &self.features {
            if let Some(name) = &feature.name {
                if name.contains(substring) {
                    return Some(uid.clone());
                }
            }
        }
        None
    }

    /// Seed initial feature state from `initValue`, matching
    /// `HCDevice.set_init_feature_values`.
    pub fn initial_state(&self) -> HashMap<String, Value> {
        let mut state = HashMap::new();
        for feature in self.features.values() {
            let Some(name) = &feature.name else { continue };
            let Some(init_value) = &feature.init_value else { continue };

            if let Some(values) = &feature.values {
                if let Some(display) = values.by_index.get(init_value) {
                    state.insert(name.clone(), json!(display));
                    continue;
                }
            }
            if feature.ref_cid.as_deref() == Some("00") && feature.ref_did.as_deref() == Some("01")
            {
                let lower = init_value.to_ascii_lowercase();
                if lower == "true" || lower == "false" {
                    state.insert(name.clone(), json!(init_value));
                } else if init_value == "1" {
                    state.insert(name.clone(), json!("True"));
                } else if init_value == "0" {
                    state.insert(name.clone(), json!("False"));
                }
            }
        }
        state
    }

    /// Merge a `/ro/descriptionChange` (or `allDescriptionChanges`) item
    /// into the catalog, creating a new entry for unknown UIDs.
    pub fn apply_description_change(&mut self, change: &Value) {
        let Some(uid) = change.get("uid").map(json_to_string) else { return };

        if let Some(feature) = self.features.get_mut(&uid) {
            if let Some(access) = change.get("access").and_then(|v| v.as_str()) {
                feature.access = Some(access.to_string());
            }
            if let Some(available) = change.get("available").and_then(|v| v.as_bool()) {
                feature.available = Some(available);
            }
            if let Some(min) = change.get("min").and_then(|v| v.as_i64()) {
                feature.min = Some(min);
            }
            if let Some(max) = change.get("max").and_then(|v| v.as_i64()) {
                feature.max = Some(max);
            }
            // `default` is stored but has no dedicated Feature field on
            // the wire beyond what min/max/values already express; the
            // Python source keeps it only for forward compatibility.
        } else {
            let mut feature = Feature::default();
            if let Some(access) = change.get("access").and_then(|v| v.as_str()) {
                feature.access = Some(access.to_string());
            }
            if let Some(available) = change.get("available").and_then(|v| v.as_bool()) {
                feature.available = Some(available);
            }
            if let Some(min) = change.get("min").and_then(|v| v.as_i64()) {
                feature.min = Some(min);
            }
            if let Some(max) = change.get("max").and_then(|v| v.as_i64()) {
                feature.max = Some(max);
            }
            self.features.insert(uid, feature);
        }
    }

    /// Decode a list of `{uid, value}` items into a name → value map, per
    /// `HCDevice.parse_values`.
    pub fn parse_values(&self, items: &[Value]) -> HashMap<String, Value> {
        let mut result = HashMap::new();

        for item in items {
            let Some(uid_val) = item.get("uid") else { continue };
            let uid = json_to_string(uid_val);
            let Some(value) = item.get("value") else { continue };
            let value_str = json_to_string(value);

            let feature = self.features.get(&uid);
            let name = feature
                .and_then(|f| f.name.clone())
                .unwrap_or_else(|| uid.clone());

            let mut decoded = value.clone();

            if let Some(feature) = feature {
                if let Some(values) = &feature.values {
                    if let Some(display) = values.by_index.get(&value_str) {
                        decoded = json!(display);
                    }
                }
                if is_boolish(None, feature.ref_cid.as_deref(), feature.ref_did.as_deref()) {
                    let lower = value_str.to_ascii_lowercase();
                    decoded = json!(lower == "1" || lower == "true" || lower == "on");
                }
                if name == "BSH.Common.Root.SelectedProgram" || name == "BSH.Common.Root.ActiveProgram"
                {
                    decoded = match self.resolve_name(&value_str) {
                        Some(program_name) => json!(program_name),
                        None => Value::Null,
                    };
                }
            }

            result.insert(name, decoded);
        }

        result
    }

    /// Validate (and, for named enum values, normalize in place) a single
    /// `{uid, value}` item destined for `POST /ro/values`.
    pub fn validate_write(&self, item: &mut Value) -> Result<(), HcError> {
        let uid_val = item
            .get("uid")
            .ok_or_else(|| HcError::InvalidValue {
                uid: "?".into(),
                value: "?".into(),
                reason: "uid is required".into(),
            })?
            .clone();
        let uid_i = uid_val.as_i64().ok_or_else(|| HcError::InvalidUid(uid_val.to_string()))?;
        let uid = uid_i.to_string();

        if item.get("value").is_none() {
            return Err(HcError::InvalidValue {
                uid: uid.clone(),
                value: "?".into(),
                reason: "value is required".into(),
            });
        }

        let feature = self
            .features
            .get(&uid)
            .ok_or_else(|| HcError::InvalidUid(uid.clone()))?;

        match feature.access.as_deref().map(str::to_ascii_lowercase) {
            Some(ref a) if a == "readwrite" || a == "writeonly" => {}
            Some(other) => {
                tracing::warn!(uid = %uid, access = %other, "writing feature without readWrite/writeOnly access, attempting anyway");
            }
            None => {
                tracing::warn!(uid = %uid, "feature has no access field, attempting write anyway");
            }
        }

        if let Some(values) = &feature.values {
            let current = item.get("value").unwrap().clone();
            let current_str = json_to_string(&current);

            if values.by_index.contains_key(&current_str) {
                if let Value::String(_) = current {
                    if let Ok(n) = current_str.parse::<i64>() {
                        item["value"] = json!(n);
                    }
                }
            } else if let Some(key) = values.by_display.get(&current_str) {
                let n: i64 = key
                    .parse()
                    .map_err(|_| HcError::InvalidValue {
                        uid: uid.clone(),
                        value: current_str.clone(),
                        reason: "enum key is not numeric".into(),
                    })?;
                item["value"] = json!(n);
            } else {
                return Err(HcError::InvalidValue {
                    uid: uid.clone(),
                    value: current_str,
                    reason: "not a valid key or display value for this feature's enum".into(),
                });
            }
        }

        if let (Some(min), Some(max)) = (feature.min, feature.max) {
            let value_i = item
                .get("value")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| HcError::InvalidValue {
                    uid: uid.clone(),
                    value: json_to_string(item.get("value").unwrap()),
                    reason: format!("value must be an integer in [{min}, {max}]"),
                })?;
            if value_i < min || value_i > max {
                return Err(HcError::InvalidValue {
                    uid: uid.clone(),
                    value: value_i.to_string(),
                    reason: format!("out of range [{min}, {max}]"),
                });
            }
        }

        Ok(())
    }

    /// Validate a `{program, options}` item destined for
    /// `POST /ro/activeProgram` or `/ro/selectedProgram`, normalizing
    /// `program` to its numeric UID in place.
    pub fn validate_program(&self, item: &mut Value) -> Result<(), HcError> {
        let program = item
            .get("program")
            .cloned()
            .ok_or_else(|| HcError::InvalidProgram {
                program: "?".into(),
                reason: "program is required".into(),
            })?;

        let numeric_uid: String = match &program {
            Value::Number(n) => n.to_string(),
            Value::String(s) if s.chars().all(|c| c.is_ascii_digit()) && !s.is_empty() => {
                s.clone()
            }
            Value::String(s) => {
                let uid = self.find_uid_by_name(s).ok_or_else(|| HcError::InvalidProgram {
                    program: s.clone(),
                    reason: "unknown program name".into(),
                })?;
                item["program"] = json!(uid.parse::<i64>().unwrap_or_default());
                if let Some(options) = item.get("options").cloned() {
                    self.validate_options(&options)?;
                }
                return Ok(());
            }
            other => {
                return Err(HcError::InvalidProgram {
                    program: other.to_string(),
                    reason: "program must be numeric or a known name".into(),
                })
            }
        };

        let name = self.resolve_name(&numeric_uid).ok_or_else(|| HcError::InvalidProgram {
            program: numeric_uid.clone(),
            reason: "program UID is not valid for this device".into(),
        })?;
        if !name.contains(".Program.") {
            return Err(HcError::InvalidProgram {
                program: numeric_uid,
                reason: format!("{name} is not a valid program"),
            });
        }
        // A digit-string `program` is left as-is here, matching
        // `HCDevice.test_program_data`: only the name-lookup branch above
        // converts to a numeric UID.

        if let Some(options) = item.get("options").cloned() {
            self.validate_options(&options)?;
        }
        Ok(())
    }

    fn validate_options(&self, options: &Value) -> Result<(), HcError> {
        let Value::Array(options) = options else { return Ok(()) };
        for option in options {
            let Some(uid_val) = option.get("uid") else { continue };
            let uid = json_to_string(uid_val);
            if !self.features.contains_key(&uid) {
                return Err(HcError::InvalidOption(uid));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureRaw;
    use std::collections::HashMap as StdMap;

    fn catalog_with(features: Vec<(&str, FeatureRaw)>) -> Catalog {
        let mut map = IndexMap::new();
        for (uid, raw) in features {
            map.insert(uid.to_string(), Feature::from(&raw));
        }
        Catalog { features: map }
    }

    fn door_state_feature() -> FeatureRaw {
        let mut values = StdMap::new();
        values.insert("0".into(), "Open".into());
        values.insert("1".into(), "Closed".into());
        FeatureRaw {
            name: Some("BSH.Common.Status.DoorState".into()),
            ref_cid: Some("03".into()),
            ref_did: Some("80".into()),
            values: Some(values),
            ..Default::default()
        }
    }

    #[test]
    fn decode_enum_value() {
        let catalog = catalog_with(vec![("256", door_state_feature())]);
        let items = vec![json!({"uid": 256, "value": 1})];
        let decoded = catalog.parse_values(&items);
        assert_eq!(decoded.get("BSH.Common.Status.DoorState"), Some(&json!("Closed")));
    }

    #[test]
    fn decode_drops_items_without_value() {
        let catalog = catalog_with(vec![("256", door_state_feature())]);
        let items = vec![json!({"uid": 256})];
        assert!(catalog.parse_values(&items).is_empty());
    }

    #[test]
    fn decode_boolean_feature() {
        let power = FeatureRaw {
            name: Some("BSH.Common.Setting.PowerState".into()),
            ref_cid: Some("01".into()),
            ref_did: Some("00".into()),
            ..Default::default()
        };
        let catalog = catalog_with(vec![("100", power)]);
        let items = vec![json!({"uid": 100, "value": 1})];
        let decoded = catalog.parse_values(&items);
        assert_eq!(decoded.get("BSH.Common.Setting.PowerState"), Some(&json!(true)));
    }

    #[test]
    fn decode_program_name_round_trip() {
        let program = FeatureRaw {
            name: Some("LaundryCare.Washer.Program.Cotton".into()),
            ..Default::default()
        };
        let active = FeatureRaw {
            name: Some("BSH.Common.Root.ActiveProgram".into()),
            ..Default::default()
        };
        let catalog = catalog_with(vec![("8195", program), ("256", active)]);
        let items = vec![json!({"uid": 256, "value": 8195})];
        let decoded = catalog.parse_values(&items);
        assert_eq!(
            decoded.get("BSH.Common.Root.ActiveProgram"),
            Some(&json!("LaundryCare.Washer.Program.Cotton"))
        );
    }

    #[test]
    fn write_validation_enforces_min_max() {
        let feature = FeatureRaw {
            name: Some("BSH.Common.Setting.Temperature".into()),
            access: Some("readWrite".into()),
            min: Some(30),
            max: Some(250),
            ..Default::default()
        };
        let catalog = catalog_with(vec![("258", feature)]);

        let mut ok = json!({"uid": 258, "value": 180});
        assert!(catalog.validate_write(&mut ok).is_ok());

        let mut too_high = json!({"uid": 258, "value": 275});
        assert!(catalog.validate_write(&mut too_high).is_err());
    }

    #[test]
    fn write_validation_translates_display_string() {
        let catalog = catalog_with(vec![("256", door_state_feature())]);
        let mut item = json!({"uid": 256, "value": "Closed"});
        catalog.validate_write(&mut item).unwrap();
        assert_eq!(item["value"], json!(1));
    }

    #[test]
    fn program_name_translates_to_uid() {
        let program = FeatureRaw {
            name: Some("LaundryCare.Washer.Program.Cotton".into()),
            ..Default::default()
        };
        let catalog = catalog_with(vec![("8195", program)]);
        let mut item = json!({"program": "Cotton", "options": []});
        catalog.validate_program(&mut item).unwrap();
        assert_eq!(item["program"], json!(8195));
    }

    #[test]
    fn program_numeric_must_be_a_program_feature() {
        let not_a_program = FeatureRaw { name: Some("BSH.Common.Status.DoorState".into()), ..Default::default() };
        let catalog = catalog_with(vec![("1", not_a_program)]);
        let mut item = json!({"program": 1});
        assert!(catalog.validate_program(&mut item).is_err());
    }

    #[test]
    fn find_uid_by_name_respects_insertion_order() {
        let a = FeatureRaw { name: Some("Foo.Program.A".into()), ..Default::default() };
        let b = FeatureRaw { name: Some("Foo.Program.B".into()), ..Default::default() };
        let catalog = catalog_with(vec![("1", a), ("2", b)]);
        assert_eq!(catalog.find_uid_by_name("Program"), Some("1".to_string()));
    }

    /// Declaration order in the device *file* must survive all the way
    /// through `Catalog::from_device`, not just when an `IndexMap` is
    /// built by hand in a test.
    #[test]
    fn from_device_preserves_declaration_order_for_find_uid_by_name() {
        let raw = r#"{
            "name": "washer",
            "host": "10.0.0.5",
            "key": "AAAA",
            "features": {
                "1": {"name": "LaundryCare.Washer.Program.CottonEco"},
                "2": {"name": "LaundryCare.Washer.Program.Cotton"}
            }
        }"#;
        let device: crate::config::DeviceConfig = serde_json::from_str(raw).unwrap();
        let catalog = Catalog::from_device(&device);
        // "Cotton" is a substring of both names; declaration order picks "1".
        assert_eq!(catalog.find_uid_by_name("Cotton"), Some("1".to_string()));
    }
}
