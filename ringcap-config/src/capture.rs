// ringcap-config/src/capture.rs
//! AF_PACKET capture configuration.
//!
//! Describes how the capture socket is negotiated: which interface, how much
//! ring memory, and the optional fanout, timestamping and filter steps.

use serde::{Deserialize, Deserializer, Serialize};
use validator::{self, Validate};

use crate::validation;

/// Packet capture configuration.
#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq)]
pub struct CaptureConfig {
    /// Network interface to bind to.
    #[validate(custom(function = validation::validate_interface))]
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Total ring memory in bytes. Accepts sizes such as `"64MiB"`.
    #[validate(range(min = 16384, max = 1073741824))]
    #[serde(default = "default_buffer_size", deserialize_with = "deserialize_size")]
    pub buffer_size: usize,

    /// Add a promiscuous membership on the socket.
    #[serde(default)]
    pub promiscuous: bool,

    #[validate(nested)]
    #[serde(default)]
    pub fanout: FanoutConfig,

    /// Ask the NIC for hardware RX timestamps.
    #[serde(default)]
    pub hw_timestamping: bool,

    #[validate(nested)]
    #[serde(default)]
    pub ring: RingConfig,

    /// Filter expression (tcpdump syntax) applied to every frame.
    #[validate(length(min = 1))]
    #[serde(default)]
    pub filter: Option<String>,
}

fn default_interface() -> String {
    "eth0".into()
}

fn default_buffer_size() -> usize {
    128 * 1024 * 1024
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            buffer_size: default_buffer_size(),
            promiscuous: false,
            fanout: FanoutConfig::default(),
            hw_timestamping: false,
            ring: RingConfig::default(),
            filter: None,
        }
    }
}

/// Kernel fanout group membership.
#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq)]
pub struct FanoutConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Sockets sharing this id split the interface's traffic by flow hash.
    #[serde(default = "default_group_id")]
    pub group_id: u16,
}

fn default_group_id() -> u16 {
    23
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            group_id: default_group_id(),
        }
    }
}

impl FanoutConfig {
    /// The group to join, if any.
    pub fn group(&self) -> Option<u16> {
        self.enabled.then_some(self.group_id)
    }
}

/// TPACKET_V3 ring geometry.
#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq)]
pub struct RingConfig {
    /// Block size in bytes; four pages when unset.
    #[validate(range(min = 4096))]
    #[validate(custom(function = validation::validate_power_of_two))]
    #[serde(default)]
    pub block_size: Option<u32>,

    #[validate(range(min = 64, max = 65536))]
    #[validate(custom(function = validation::validate_frame_alignment))]
    #[serde(default = "default_frame_size")]
    pub frame_size: u32,

    /// How long the kernel may hold a partially filled block.
    #[validate(range(min = 1, max = 60000))]
    #[serde(default = "default_retire_timeout")]
    pub retire_timeout_ms: u32,
}

fn default_frame_size() -> u32 {
    2048
}

fn default_retire_timeout() -> u32 {
    100
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            block_size: None,
            frame_size: default_frame_size(),
            retire_timeout_ms: default_retire_timeout(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeValue {
    Num(usize),
    Str(String),
}

/// Custom deserializer to allow human-friendly sizes (e.g. "64MiB") or direct numbers.
fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    match SizeValue::deserialize(deserializer)? {
        SizeValue::Num(n) => Ok(n),
        SizeValue::Str(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (num_part, unit_part) = s.split_at(split);

    let number: f64 = num_part
        .parse()
        .map_err(|_| format!("invalid size '{}'", s))?;
    let multiplier = match unit_part.trim().to_lowercase().as_str() {
        "" | "b" => 1.0,
        "kb" | "kib" => 1024.0,
        "mb" | "mib" => 1024.0 * 1024.0,
        "gb" | "gib" => 1024.0 * 1024.0 * 1024.0,
        unit => return Err(format!("unknown size unit '{}'", unit)),
    };
    Ok((number * multiplier) as usize)
}
