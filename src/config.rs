//! Engine tuning knobs.
//!
//! Hosts embed this struct in their own configuration; every field has a
//! conservative default so a deserialized empty table yields a working
//! engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::encoder::Codec;
use crate::window::{Direction, WindowBuffer, WindowError};

fn default_windowsize() -> usize {
    8
}

fn default_length_factor() -> usize {
    2
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    10
}

fn default_fragsize_up() -> usize {
    96
}

fn default_fragsize_down() -> usize {
    1024
}

fn default_codec_up() -> String {
    "base32".to_string()
}

fn default_codec_down() -> String {
    "base64".to_string()
}

/// Tuning knobs for one tunnel endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Max upstream fragments in flight.
    #[serde(default = "default_windowsize")]
    pub windowsize_up: usize,

    /// Max downstream fragments in flight.
    #[serde(default = "default_windowsize")]
    pub windowsize_down: usize,

    /// Ring length is the window size times this factor, so new data can
    /// queue behind the in-flight window.
    #[serde(default = "default_length_factor")]
    pub length_factor: usize,

    /// Resend deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Resend attempts before a fragment is dropped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Upstream fragment payload size (hostname-constrained).
    #[serde(default = "default_fragsize_up")]
    pub fragsize_up: usize,

    /// Downstream fragment payload size.
    #[serde(default = "default_fragsize_down")]
    pub fragsize_down: usize,

    /// Codec name for upstream data ("base32", "base64", ...).
    #[serde(default = "default_codec_up")]
    pub codec_up: String,

    /// Codec name for downstream data.
    #[serde(default = "default_codec_down")]
    pub codec_down: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            windowsize_up: default_windowsize(),
            windowsize_down: default_windowsize(),
            length_factor: default_length_factor(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            fragsize_up: default_fragsize_up(),
            fragsize_down: default_fragsize_down(),
            codec_up: default_codec_up(),
            codec_down: default_codec_down(),
        }
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn uplink_codec(&self) -> Codec {
        Codec::from_name(&self.codec_up)
    }

    pub fn downlink_codec(&self) -> Codec {
        Codec::from_name(&self.codec_down)
    }

    /// A sending window configured from these knobs.
    pub fn uplink_window(&self) -> Result<WindowBuffer, WindowError> {
        self.window(Direction::Sending)
    }

    /// A receiving window configured from these knobs.
    pub fn downlink_window(&self) -> Result<WindowBuffer, WindowError> {
        self.window(Direction::Recving)
    }

    fn window(&self, direction: Direction) -> Result<WindowBuffer, WindowError> {
        let (windowsize, fragsize) = match direction {
            Direction::Sending => (self.windowsize_up, self.fragsize_up),
            Direction::Recving => (self.windowsize_down, self.fragsize_down),
        };
        let mut w = WindowBuffer::new(
            windowsize * self.length_factor,
            windowsize,
            fragsize,
            direction,
        )?;
        w.set_timeout(self.timeout());
        w.set_max_retries(self.max_retries);
        Ok(w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build_working_windows() {
        let cfg = EngineConfig::default();
        let snd = cfg.uplink_window().unwrap();
        assert_eq!(snd.windowsize(), 8);
        assert_eq!(snd.length(), 16);
        assert_eq!(snd.maxfraglen(), 96);
        let rcv = cfg.downlink_window().unwrap();
        assert_eq!(rcv.maxfraglen(), 1024);
        assert_eq!(cfg.uplink_codec(), Codec::Base32);
        assert_eq!(cfg.downlink_codec(), Codec::Base64);
    }

    #[test]
    fn bad_geometry_is_refused() {
        let cfg = EngineConfig {
            windowsize_up: 0,
            ..Default::default()
        };
        assert!(cfg.uplink_window().is_err());
    }

    #[test]
    fn unknown_codec_name_maps_to_unset() {
        let cfg = EngineConfig {
            codec_up: "rot13".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.uplink_codec(), Codec::Unset);
    }
}
