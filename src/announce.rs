//! Topic layout and the autodiscovery announcements which let an automation
//! platform create a sensor (and an enable switch) for each device.

use crate::{device::DeviceDescriptor, gateway::PublishRequest, payload};
use serde::Serialize;

pub const SWITCH_ON: &str = "ON";
pub const SWITCH_OFF: &str = "OFF";

/// Topics used for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub state: String,
    pub config: String,
    pub switch: Option<SwitchTopics>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchTopics {
    pub config: String,
    pub state: String,
    pub set: String,
}

impl Topics {
    /// Devices listed in the configuration all share the base topic
    pub fn manual(base: &str) -> Self {
        Topics {
            state: format!("{base}/state"),
            config: format!("{base}/config"),
            switch: None,
        }
    }

    /// Discovered devices get their own subtree
    pub fn discovered(base: &str, slug: &str) -> Self {
        Topics {
            state: format!("{base}/{slug}/state"),
            config: format!("{base}/{slug}/config"),
            switch: Some(SwitchTopics {
                config: format!("{base}/{slug}/switch/config"),
                state: format!("{base}/{slug}/switch/state"),
                set: format!("{base}/{slug}/switch/set"),
            }),
        }
    }
}

#[derive(Serialize)]
struct DeviceInfo<'a> {
    identifiers: [&'a str; 1],
    name: String,
    model: &'a str,
}

#[derive(Serialize)]
struct SensorConfig<'a> {
    name: String,
    state_topic: &'a str,
    icon: &'a str,
    unique_id: &'a str,
    device: DeviceInfo<'a>,
}

#[derive(Serialize)]
struct SwitchConfig<'a> {
    name: String,
    command_topic: &'a str,
    state_topic: &'a str,
    payload_on: &'a str,
    payload_off: &'a str,
    icon: &'a str,
    unique_id: String,
    device: DeviceInfo<'a>,
}

fn device_info<'a>(gateway_name: &str, dev: &'a DeviceDescriptor) -> DeviceInfo<'a> {
    DeviceInfo {
        identifiers: [dev.unique_id.as_str()],
        name: format!("{gateway_name} - {}", dev.name),
        model: "evmqtt",
    }
}

/// Payload for the switch state topic
pub fn switch_state(enabled: bool) -> &'static str {
    if enabled {
        SWITCH_ON
    } else {
        SWITCH_OFF
    }
}

/// Parse a command received on the switch set topic
pub fn parse_switch(payload: &str) -> Option<bool> {
    let payload = payload.trim();

    if payload.eq_ignore_ascii_case(SWITCH_ON) {
        Some(true)
    } else if payload.eq_ignore_ascii_case(SWITCH_OFF) {
        Some(false)
    } else {
        None
    }
}

/// All retained messages announcing a device. Publishing them again is
/// harmless, the broker simply replaces the retained copies.
pub fn announcement(
    gateway_name: &str,
    dev: &DeviceDescriptor,
    topics: &Topics,
    enabled: bool,
) -> Result<Vec<PublishRequest>, String> {
    let sensor = SensorConfig {
        name: format!("{gateway_name} - {}", dev.name),
        state_topic: &topics.state,
        icon: "mdi:code-json",
        unique_id: &dev.unique_id,
        device: device_info(gateway_name, dev),
    };

    let mut list = vec![PublishRequest::new(
        &topics.config,
        payload::encode(&sensor)?,
        true,
    )];

    if let Some(switch) = &topics.switch {
        let config = SwitchConfig {
            name: format!("{gateway_name} - {} Enable", dev.name),
            command_topic: &switch.set,
            state_topic: &switch.state,
            payload_on: SWITCH_ON,
            payload_off: SWITCH_OFF,
            icon: "mdi:power",
            unique_id: format!("{}_switch", dev.unique_id),
            device: device_info(gateway_name, dev),
        };

        list.push(PublishRequest::new(
            &switch.config,
            payload::encode(&config)?,
            true,
        ));
        list.push(PublishRequest::new(
            &switch.state,
            switch_state(enabled),
            true,
        ));
    }

    Ok(list)
}
