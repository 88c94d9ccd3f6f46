//! Tool configuration loaded from `--config`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use vigil_packet::PacketConfig;
use vigil_recorder::RecorderConfig;
use vigil_ringbuffer::RingBufferConfig;

/// Settings shared by all subcommands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub packet: PacketConfig,
    pub ring_buffer: RingBufferConfig,
    pub recorder: RecorderConfig,
}

impl ToolConfig {
    /// Load from a JSON file, or use defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}
