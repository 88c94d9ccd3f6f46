//! Packet construction settings.

use serde::{Deserialize, Serialize};

/// How packets are built from producer NAL units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketConfig {
    /// Insert emulation-prevention bytes when packing raw NAL units into an
    /// Annex-B stream. Disable only for sources known to deliver payloads
    /// that never need escaping.
    pub escape_emulation_prevention: bool,
}

impl Default for PacketConfig {
    fn default() -> Self {
        Self {
            escape_emulation_prevention: true,
        }
    }
}
