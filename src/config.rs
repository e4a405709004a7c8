//! CLI flags and the on-disk device configuration file.
//!
//! The device file is produced by the (out-of-scope) OAuth/XML tooling and
//! consumed read-only at startup; this module only deserializes it.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use indexmap::IndexMap;
use serde::Deserialize;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Bridge Home Connect appliances to MQTT")]
pub struct Args {
    /// Path to the device configuration JSON file.
    #[arg(short, long, env = "HCPY_DEVICES_FILE", default_value = "config/devices.json")]
    pub devices_file: PathBuf,

    /// MQTT broker hostname.
    #[arg(long, env = "HCPY_MQTT_HOST", default_value = "localhost")]
    pub mqtt_host: String,

    /// MQTT broker port.
    #[arg(long, env = "HCPY_MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    /// Topic prefix for every published/subscribed topic.
    #[arg(short = 'p', long, env = "HCPY_MQTT_PREFIX", default_value = "homeconnect/")]
    pub mqtt_prefix: String,

    #[arg(long, env = "HCPY_MQTT_USERNAME")]
    pub mqtt_username: Option<String>,

    #[arg(long, env = "HCPY_MQTT_PASSWORD")]
    pub mqtt_password: Option<String>,

    #[arg(long, env = "HCPY_MQTT_CLIENTNAME", default_value = "hcpy1")]
    pub mqtt_clientname: String,

    /// DNS suffix appended to every device's `host` field.
    #[arg(long, env = "HCPY_DOMAIN_SUFFIX", default_value = "")]
    pub domain_suffix: String,

    /// Enable verbose RX/TX frame logging.
    #[arg(long, env = "HCPY_DEBUG", default_value_t = false)]
    pub debug: bool,
}

/// A single feature's metadata, exactly as it appears under a device's
/// `features` map, keyed by decimal-string UID.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FeatureRaw {
    pub name: Option<String>,
    pub access: Option<String>,
    pub available: Option<bool>,
    #[serde(rename = "refCID")]
    pub ref_cid: Option<String>,
    #[serde(rename = "refDID")]
    pub ref_did: Option<String>,
    pub values: Option<HashMap<String, String>>,
    #[serde(rename = "initValue")]
    pub init_value: Option<String>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    #[serde(rename = "stepSize")]
    pub step_size: Option<i64>,
    pub handling: Option<String>,
    pub default: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DeviceDescription {
    pub brand: Option<String>,
    pub model: Option<String>,
    pub version: Option<String>,
    pub revision: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub host: String,
    pub key: String,
    pub iv: Option<String>,
    #[serde(default)]
    pub description: DeviceDescription,
    /// Declaration order matters: `Catalog::find_uid_by_name` returns the
    /// first match in this order, mirroring `HCDevice.py`'s use of a plain
    /// (insertion-ordered) `dict`.
    pub features: IndexMap<String, FeatureRaw>,
}

pub fn load_devices(path: &std::path::Path) -> anyhow::Result<Vec<DeviceConfig>> {
    let bytes = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("reading devices file {}: {e}", path.display()))?;
    let devices: Vec<DeviceConfig> = serde_json::from_slice(&bytes)
        .map_err(|e| anyhow::anyhow!("parsing devices file {}: {e}", path.display()))?;
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_device() {
        let raw = r#"[{
            "name": "washer",
            "host": "192.168.1.5",
            "key": "abcd",
            "features": {
                "256": {"name": "BSH.Common.Status.DoorState", "refCID": "03", "refDID": "80"}
            }
        }]"#;
        let devices: Vec<DeviceConfig> = serde_json::from_str(raw).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "washer");
        assert!(devices[0].iv.is_none());
        assert_eq!(
            devices[0].features.get("256").unwrap().name.as_deref(),
            Some("BSH.Common.Status.DoorState")
        );
    }
}
