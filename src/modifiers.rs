//! Track which modifier keys are held down on a device, and combine them with
//! the next key press into a composite label such as `KEY_A_KEY_LEFTSHIFT`.

use crate::decoder::{decode, KeyState, RawEvent};
use bitflags::bitflags;
use evdev::Key;
use itertools::Itertools;
use std::collections::HashSet;

bitflags! {
    /// Set of held modifiers. The bit order is the canonical label order.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Modifiers: u8 {
        const LEFTSHIFT = 1 << 0;
        const RIGHTSHIFT = 1 << 1;
        const LEFTCTRL = 1 << 2;
        const RIGHTCTRL = 1 << 3;
        const LEFTALT = 1 << 4;
        const RIGHTALT = 1 << 5;
        const LEFTMETA = 1 << 6;
        const RIGHTMETA = 1 << 7;
    }
}

/// Modifier classification table, in canonical order
pub const MODIFIER_KEYS: [(Key, Modifiers); 8] = [
    (Key::KEY_LEFTSHIFT, Modifiers::LEFTSHIFT),
    (Key::KEY_RIGHTSHIFT, Modifiers::RIGHTSHIFT),
    (Key::KEY_LEFTCTRL, Modifiers::LEFTCTRL),
    (Key::KEY_RIGHTCTRL, Modifiers::RIGHTCTRL),
    (Key::KEY_LEFTALT, Modifiers::LEFTALT),
    (Key::KEY_RIGHTALT, Modifiers::RIGHTALT),
    (Key::KEY_LEFTMETA, Modifiers::LEFTMETA),
    (Key::KEY_RIGHTMETA, Modifiers::RIGHTMETA),
];

impl Modifiers {
    /// The modifier bit for a key code, if the key is a modifier
    pub fn from_code(code: u16) -> Option<Modifiers> {
        MODIFIER_KEYS
            .iter()
            .find(|(key, _)| key.code() == code)
            .map(|(_, flag)| *flag)
    }

    /// Key names of the held modifiers, in canonical order
    pub fn names(self) -> impl Iterator<Item = String> {
        MODIFIER_KEYS
            .into_iter()
            .filter(move |(_, flag)| self.contains(*flag))
            .map(|(key, _)| format!("{key:?}"))
    }
}

/// Per-device modifier state
#[derive(Debug, Clone)]
pub struct ModifierTracker {
    held: Modifiers,
    ignored: HashSet<String>,
}

impl Default for ModifierTracker {
    fn default() -> Self {
        ModifierTracker::new(["KEY_NUMLOCK".to_owned()])
    }
}

impl ModifierTracker {
    /// Create a tracker which never emits labels for the ignored key names
    pub fn new(ignored: impl IntoIterator<Item = String>) -> Self {
        ModifierTracker {
            held: Modifiers::empty(),
            ignored: ignored.into_iter().collect(),
        }
    }

    pub fn held(&self) -> Modifiers {
        self.held
    }

    pub fn reset(&mut self) {
        self.held = Modifiers::empty();
    }

    /// Feed one event through the tracker. Returns the composite label when a
    /// non-modifier key is pressed.
    pub fn on_event(&mut self, ev: &RawEvent) -> Option<String> {
        let action = decode(ev)?;

        if let Some(flag) = Modifiers::from_code(action.code) {
            match action.state {
                KeyState::Pressed => self.held.insert(flag),
                KeyState::Released => self.held.remove(flag),
                KeyState::Repeat => (),
            }

            return None;
        }

        if action.state != KeyState::Pressed || self.ignored.contains(&action.name) {
            return None;
        }

        Some(
            std::iter::once(action.name)
                .chain(self.held.names())
                .join("_"),
        )
    }
}
