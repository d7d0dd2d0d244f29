//! Decode raw kernel input events into symbolic key names.

use evdev::{EventType, InputEvent, Key};
use std::time::SystemTime;

/// A single `struct input_event` as read from an event device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub event_type: u16,
    pub code: u16,
    pub value: i32,
    pub timestamp: SystemTime,
}

impl RawEvent {
    pub fn new(event_type: u16, code: u16, value: i32) -> Self {
        RawEvent {
            event_type,
            code,
            value,
            timestamp: SystemTime::UNIX_EPOCH,
        }
    }

    /// Key event with the given state
    pub fn key(key: Key, state: KeyState) -> Self {
        RawEvent::new(EventType::KEY.0, key.code(), state as i32)
    }
}

impl From<&InputEvent> for RawEvent {
    fn from(ev: &InputEvent) -> Self {
        RawEvent {
            event_type: ev.event_type().0,
            code: ev.code(),
            value: ev.value(),
            timestamp: ev.timestamp(),
        }
    }
}

impl From<InputEvent> for RawEvent {
    fn from(ev: InputEvent) -> Self {
        RawEvent::from(&ev)
    }
}

/// Value field of an `EV_KEY` event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Released = 0,
    Pressed = 1,
    Repeat = 2,
}

impl KeyState {
    pub fn from_value(value: i32) -> Option<Self> {
        match value {
            0 => Some(KeyState::Released),
            1 => Some(KeyState::Pressed),
            2 => Some(KeyState::Repeat),
            _ => None,
        }
    }
}

/// A key event which survived decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAction {
    pub code: u16,
    pub name: String,
    pub state: KeyState,
}

/// Decode a raw event. Anything which is not a key event, or has a key value
/// the kernel does not define, is not relevant.
pub fn decode(ev: &RawEvent) -> Option<KeyAction> {
    if ev.event_type != EventType::KEY.0 {
        return None;
    }

    let state = KeyState::from_value(ev.value)?;

    Some(KeyAction {
        code: ev.code,
        name: key_name(ev.code),
        state,
    })
}

/// Symbolic name for a key code, e.g. `KEY_VOLUMEUP`. A code with aliases
/// gets its primary name only (`BTN_SOUTH`, never `BTN_A`). Codes missing
/// from the kernel key table become `UNKNOWN_<code>`.
pub fn key_name(code: u16) -> String {
    let name = format!("{:?}", Key::new(code));

    if name.starts_with("KEY_") || name.starts_with("BTN_") {
        name
    } else {
        format!("UNKNOWN_{code}")
    }
}
