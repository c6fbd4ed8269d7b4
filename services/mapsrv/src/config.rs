//! Service configuration.
//!
//! Layered the usual way: built-in defaults, then an optional YAML file,
//! then `MAPSRV_`-prefixed environment variables (`MAPSRV_SERVICE__RETRIES`
//! overrides `service.retries`).

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{MapperError, Result};
use crate::panel::PanelSettings;

pub const DEFAULT_CONFIG_PATH: &str = "config/mapsrv.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub service: ServiceSection,
    pub logging: LoggingSection,
    pub profile: ProfileSection,
    pub mqtt: MqttSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    pub name: String,
    /// Collection cycle (ms) for visitors that leave theirs unset.
    pub default_collect_cycle_ms: u64,
    /// Reconnect-and-retry attempts for driver reads/writes.
    pub retries: usize,
    /// Publish every sample instead of suppressing unchanged values.
    pub always_publish: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    /// Directory for the daily-rotated log file; console-only when unset.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSection {
    /// Path to the device-profile JSON document.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service: ServiceSection::default(),
            logging: LoggingSection {
                level: "info".to_string(),
                dir: None,
            },
            profile: ProfileSection::default(),
            mqtt: MqttSection::default(),
        }
    }
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: "mapsrv".to_string(),
            default_collect_cycle_ms: 1000,
            retries: 3,
            always_publish: false,
        }
    }
}

impl Default for ProfileSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("config/profile.json"),
        }
    }
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "mapsrv".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from defaults, an optional YAML file, and the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        Figment::from(Serialized::defaults(ServiceConfig::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed("MAPSRV_").split("__"))
            .extract()
            .map_err(|e| MapperError::config(format!("load {}: {e}", path.display())))
    }

    pub fn panel_settings(&self) -> PanelSettings {
        PanelSettings {
            default_collect_cycle: std::time::Duration::from_millis(
                self.service.default_collect_cycle_ms.max(1),
            ),
            retries: self.service.retries,
            always_publish: self.service.always_publish,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.service.name, "mapsrv");
        assert_eq!(cfg.service.default_collect_cycle_ms, 1000);
        assert_eq!(cfg.service.retries, 3);
        assert!(!cfg.mqtt.enabled);
        let settings = cfg.panel_settings();
        assert_eq!(settings.default_collect_cycle.as_millis(), 1000);
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "service:\n  retries: 5\nprofile:\n  path: /etc/mapper/profile.json\nmqtt:\n  enabled: true\n  host: broker.local"
        )
        .unwrap();

        let cfg = ServiceConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.service.retries, 5);
        assert_eq!(cfg.profile.path, PathBuf::from("/etc/mapper/profile.json"));
        assert!(cfg.mqtt.enabled);
        assert_eq!(cfg.mqtt.host, "broker.local");
        // untouched sections keep their defaults
        assert_eq!(cfg.service.default_collect_cycle_ms, 1000);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = ServiceConfig::load(Some(Path::new("/nonexistent/mapsrv.yaml"))).unwrap();
        assert_eq!(cfg.service.name, "mapsrv");
    }
}
