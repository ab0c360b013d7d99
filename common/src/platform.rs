//! Hardware-facing collaborators. Each target supplies its own implementations.

use crate::{
    error::{ContentError, NetworkError},
    payload::ImagePayload,
    status::StatusScreen,
};

pub trait Clock {
    /// Milliseconds since this boot.
    fn uptime_ms(&self) -> u64;
    fn delay_ms(&mut self, ms: u32);
    /// Synchronizes wall time; returns the current unix time when it succeeded.
    fn sync_time(&mut self) -> Option<u64>;
    fn epoch_now(&self) -> Option<u64>;
}

pub trait ButtonInput {
    fn is_pressed(&mut self) -> bool;
}

pub trait Network {
    fn has_credentials(&self) -> bool;
    fn connect(&mut self) -> Result<(), NetworkError>;
    /// Blocks until the captive portal yields working credentials or gives up.
    fn run_portal(&mut self) -> Result<(), NetworkError>;
    fn forget_credentials(&mut self) -> Result<(), NetworkError>;
    fn is_connected(&self) -> bool;
    fn rssi(&self) -> i32;
    fn mac_address(&self) -> String;
    fn disconnect(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderHints {
    pub full_refresh: bool,
    pub temp_profile: u32,
    pub maximum_compatibility: bool,
}

pub trait Renderer {
    fn show_image(&mut self, image: &ImagePayload, hints: &RenderHints) -> Result<(), ContentError>;
    fn show_status(&mut self, screen: &StatusScreen) -> Result<(), ContentError>;
}
