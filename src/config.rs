//! Gateway configuration, read from a toml file.

use serde::{Deserialize, Deserializer};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "EVMQTT_CONFIG";

/// Files tried in order when no configuration file is given
pub const SEARCH_PATH: &[&str] = &["config.local.toml", "config.toml", "/etc/evmqtt.toml"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Host name or address of the MQTT broker
    pub serverip: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Gateway name shown in the automation platform
    pub name: String,
    /// Base topic
    pub topic: String,
    /// Input devices to monitor, unless discovering
    pub devices: Vec<String>,
    pub auto_discover: bool,
    /// Devices which start enabled when discovering; empty means all of them
    pub enabled_devices: Vec<String>,
    pub filter_keys_only: bool,
    /// Grab the devices, so their key presses do not reach anything else
    pub grab: bool,
    pub ignored_keys: Vec<String>,
    #[serde(deserialize_with = "duration")]
    pub connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            serverip: String::new(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            name: "evmqtt".into(),
            topic: "homeassistant/sensor/evmqtt".into(),
            devices: Vec::new(),
            auto_discover: false,
            enabled_devices: Vec::new(),
            filter_keys_only: true,
            grab: true,
            ignored_keys: vec!["KEY_NUMLOCK".into()],
            connect_timeout: Duration::from_secs(30),
        }
    }
}

fn duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let s = String::deserialize(deserializer)?;

    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

impl Config {
    fn read(s: &str) -> Result<Config, String> {
        let mut config: Config = toml::from_str(s).map_err(|e| e.to_string())?;

        while config.topic.ends_with('/') {
            config.topic.pop();
        }

        Ok(config)
    }

    pub fn parse(s: &str) -> Result<Config, String> {
        let config = Config::read(s)?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.serverip.is_empty() {
            return Err("serverip must be set".into());
        }

        if self.port == 0 {
            return Err("port must not be 0".into());
        }

        if self.topic.is_empty() {
            return Err("topic must not be empty".into());
        }

        if self.topic.contains(['+', '#']) {
            return Err(format!("topic '{}' must not contain wildcards", self.topic));
        }

        if !self.auto_discover && self.devices.is_empty() {
            return Err("no devices listed and auto_discover is off".into());
        }

        Ok(())
    }

    /// Whether a discovered device starts enabled
    pub fn initially_enabled(&self, path: &str) -> bool {
        self.enabled_devices.is_empty() || self.enabled_devices.iter().any(|p| p == path)
    }
}

/// Find the configuration file: an explicit path, the environment, or the
/// first file of the search path which exists
pub fn locate(explicit: Option<&Path>) -> Result<PathBuf, String> {
    if let Some(path) = explicit {
        return Ok(path.to_owned());
    }

    if let Some(path) = env::var_os(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }

    SEARCH_PATH
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
        .ok_or_else(|| format!("no configuration file found, tried {}", SEARCH_PATH.join(", ")))
}

/// Load and validate the configuration. `auto_discover` overrides the
/// setting in the file.
pub fn load(explicit: Option<&Path>, auto_discover: bool) -> Result<Config, String> {
    let path = locate(explicit)?;

    let s = fs::read_to_string(&path).map_err(|e| format!("{}: {e}", path.display()))?;

    let mut config = Config::read(&s).map_err(|e| format!("{}: {e}", path.display()))?;

    if auto_discover {
        config.auto_discover = true;
    }

    config
        .validate()
        .map_err(|e| format!("{}: {e}", path.display()))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let config = Config::parse(
            r#"
            serverip = "192.168.1.2"
            devices = ["/dev/input/event0"]
            "#,
        )
        .unwrap();

        assert_eq!(
            config,
            Config {
                serverip: "192.168.1.2".into(),
                devices: vec!["/dev/input/event0".into()],
                ..Config::default()
            }
        );
        assert_eq!(config.port, 1883);
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert!(config.initially_enabled("/dev/input/event7"));
    }

    #[test]
    fn full() {
        let config = Config::parse(
            r#"
            serverip = "mqtt.local"
            port = 8883
            username = "ha"
            password = "secret"
            name = "Living Room"
            topic = "homeassistant/sensor/living/"
            auto_discover = true
            enabled_devices = ["/dev/input/event3"]
            filter_keys_only = false
            grab = false
            ignored_keys = []
            connect_timeout = "1m 30s"
            "#,
        )
        .unwrap();

        assert_eq!(config.topic, "homeassistant/sensor/living");
        assert_eq!(config.port, 8883);
        assert_eq!(config.name, "Living Room");
        assert!(config.auto_discover);
        assert!(!config.filter_keys_only);
        assert!(!config.grab);
        assert!(config.ignored_keys.is_empty());
        assert_eq!(config.connect_timeout, Duration::from_secs(90));
        assert!(config.initially_enabled("/dev/input/event3"));
        assert!(!config.initially_enabled("/dev/input/event4"));
    }

    #[test]
    fn invalid() {
        assert_eq!(
            Config::parse(r#"devices = ["/dev/input/event0"]"#),
            Err("serverip must be set".into())
        );

        assert_eq!(
            Config::parse(r#"serverip = "localhost""#),
            Err("no devices listed and auto_discover is off".into())
        );

        assert_eq!(
            Config::parse(
                r#"
                serverip = "localhost"
                auto_discover = true
                port = 0
                "#
            ),
            Err("port must not be 0".into())
        );

        assert_eq!(
            Config::parse(
                r#"
                serverip = "localhost"
                auto_discover = true
                topic = "/"
                "#
            ),
            Err("topic must not be empty".into())
        );

        assert_eq!(
            Config::parse(
                r#"
                serverip = "localhost"
                auto_discover = true
                topic = "sensor/#"
                "#
            ),
            Err("topic 'sensor/#' must not contain wildcards".into())
        );

        assert!(Config::parse(
            r#"
            serverip = "localhost"
            auto_discover = true
            port = 70000
            "#
        )
        .is_err());

        assert!(Config::parse(
            r#"
            serverip = "localhost"
            auto_discover = true
            connect_timeout = "soon"
            "#
        )
        .is_err());

        assert!(Config::parse(
            r#"
            serverip = "localhost"
            auto_discover = true
            server = "typo"
            "#
        )
        .is_err());
    }
}
