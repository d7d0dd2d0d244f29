//! Enumerate the input devices on linux and give each of them a stable,
//! topic-safe name.

use bitflags::bitflags;
use evdev::{AttributeSetRef, Device, EventType};
use itertools::Itertools;
use log::{debug, info};
use std::{
    collections::HashSet,
    fmt,
    path::PathBuf,
};

bitflags! {
    /// Event types a device advertises
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u16 {
        const SYN = 1 << 0;
        const KEY = 1 << 1;
        const REL = 1 << 2;
        const ABS = 1 << 3;
        const MSC = 1 << 4;
        const SW = 1 << 5;
        const LED = 1 << 6;
        const SND = 1 << 7;
        const REP = 1 << 8;
        const FF = 1 << 9;
        const PWR = 1 << 10;
        const FF_STATUS = 1 << 11;
    }
}

impl Capabilities {
    /// Map a kernel `EV_*` number to its capability bit
    pub fn from_event_type(ty: u16) -> Capabilities {
        match ty {
            0x00 => Capabilities::SYN,
            0x01 => Capabilities::KEY,
            0x02 => Capabilities::REL,
            0x03 => Capabilities::ABS,
            0x04 => Capabilities::MSC,
            0x05 => Capabilities::SW,
            0x11 => Capabilities::LED,
            0x12 => Capabilities::SND,
            0x14 => Capabilities::REP,
            0x15 => Capabilities::FF,
            0x16 => Capabilities::PWR,
            0x17 => Capabilities::FF_STATUS,
            _ => Capabilities::empty(),
        }
    }

    pub fn from_supported(events: &AttributeSetRef<EventType>) -> Capabilities {
        events
            .iter()
            .fold(Capabilities::empty(), |caps, ty| {
                caps | Capabilities::from_event_type(ty.0)
            })
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.iter_names().map(|(name, _)| format!("EV_{name}")).join(" ")
        )
    }
}

/// One input device which may be monitored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Path to the event device, e.g. /dev/input/event3
    pub path: String,
    /// Human readable name reported by the kernel
    pub name: String,
    pub capabilities: Capabilities,
    /// Topic-safe name, unique among the discovered devices
    pub slug: String,
    /// Identifier for the automation platform
    pub unique_id: String,
    /// Whether key events should be published when the worker starts
    pub enabled: bool,
}

impl DeviceDescriptor {
    /// Descriptor for a device listed explicitly in the configuration
    pub fn manual(path: &str, name: &str) -> Self {
        DeviceDescriptor {
            path: path.to_owned(),
            name: name.to_owned(),
            capabilities: Capabilities::KEY,
            slug: slugify(name),
            unique_id: format!("evmqtt_{}", path.replace('/', "_")),
            enabled: true,
        }
    }
}

/// Convert a device name into a slug: lowercase, with every run of
/// characters other than ascii letters and digits replaced by one hyphen
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());

    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }

    while slug.ends_with('-') {
        slug.pop();
    }

    if slug.is_empty() {
        "unknown-device".into()
    } else {
        slug
    }
}

/// Hands out unique slugs. A slug which is already taken gets the first free
/// numeric suffix, so the second "remote" becomes "remote-1".
#[derive(Debug, Default)]
pub struct SlugAllocator {
    used: HashSet<String>,
}

impl SlugAllocator {
    pub fn allocate(&mut self, slug: String) -> String {
        if self.used.insert(slug.clone()) {
            return slug;
        }

        let mut suffix = 1;

        loop {
            let candidate = format!("{slug}-{suffix}");

            if self.used.insert(candidate.clone()) {
                return candidate;
            }

            suffix += 1;
        }
    }
}

fn unique_id(path: &str, slug: &str) -> String {
    let event = path.rsplit('/').next().unwrap_or(path);

    format!("evmqtt_{slug}_{event}")
}

/// A device found during enumeration, before slugs are assigned
#[derive(Debug, Clone)]
pub struct Candidate {
    pub path: PathBuf,
    pub name: String,
    pub capabilities: Capabilities,
}

impl Candidate {
    fn from_device(path: PathBuf, device: &Device) -> Self {
        Candidate {
            name: device.name().unwrap_or_default().to_owned(),
            capabilities: Capabilities::from_supported(device.supported_events()),
            path,
        }
    }
}

/// Turn enumerated devices into descriptors. Candidates are ordered by path
/// first, so slug suffixes do not depend on the order the kernel lists them.
pub fn register(mut candidates: Vec<Candidate>, filter_keys_only: bool) -> Vec<DeviceDescriptor> {
    candidates.sort_by(|a, b| a.path.cmp(&b.path));

    let mut slugs = SlugAllocator::default();
    let mut list = Vec::new();

    for candidate in candidates {
        let path = candidate.path.to_string_lossy().into_owned();

        if filter_keys_only && !candidate.capabilities.contains(Capabilities::KEY) {
            debug!("skipping {path} '{}': no key capabilities", candidate.name);
            continue;
        }

        let slug = slugs.allocate(slugify(&candidate.name));

        debug!("discovered {path} '{}' as {slug}", candidate.name);

        list.push(DeviceDescriptor {
            unique_id: unique_id(&path, &slug),
            path,
            name: candidate.name,
            capabilities: candidate.capabilities,
            slug,
            enabled: true,
        });
    }

    list
}

/// Enumerate all input devices which can be opened
pub fn enumerate() -> Vec<Candidate> {
    evdev::enumerate()
        .map(|(path, device)| Candidate::from_device(path, &device))
        .collect()
}

/// Discover the input devices to monitor
pub fn discover(filter_keys_only: bool) -> Vec<DeviceDescriptor> {
    let list = register(enumerate(), filter_keys_only);

    info!("discovered {} input device(s)", list.len());

    list
}
