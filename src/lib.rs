//! Publish key presses from Linux input devices to an MQTT broker.

pub mod announce;
pub mod config;
pub mod decoder;
pub mod device;
pub mod gateway;
pub mod modifiers;
pub mod payload;
pub mod registry;
pub mod source;
pub mod worker;

#[cfg(test)]
mod testing;
