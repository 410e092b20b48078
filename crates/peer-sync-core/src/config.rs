//! Per-endpoint session configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::message::{DEFAULT_MAX_WIRE_BYTES, MessageCodec};

/// Which side of the pair this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The initiating device. Checks pairing before sending.
    #[default]
    Primary,
    /// The companion device. Bootstraps its context from the primary on first contact.
    Companion,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Companion => f.write_str("companion"),
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Role of this endpoint.
    pub role: Role,
    /// Largest encoded message accepted by the codec.
    pub max_wire_bytes: usize,
    /// Whether a companion requests the primary's context on first contact.
    pub bootstrap_context: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            role: Role::Primary,
            max_wire_bytes: DEFAULT_MAX_WIRE_BYTES,
            bootstrap_context: true,
        }
    }
}

impl SessionConfig {
    /// Create a configuration for the given role.
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            ..Self::default()
        }
    }

    /// Override the encoded size limit.
    #[must_use]
    pub const fn with_max_wire_bytes(mut self, max_wire_bytes: usize) -> Self {
        self.max_wire_bytes = max_wire_bytes;
        self
    }

    /// Enable or disable the companion's context bootstrap.
    #[must_use]
    pub const fn with_bootstrap_context(mut self, bootstrap_context: bool) -> Self {
        self.bootstrap_context = bootstrap_context;
        self
    }

    /// Codec matching this configuration.
    #[must_use]
    pub const fn codec(&self) -> MessageCodec {
        MessageCodec::new(self.max_wire_bytes)
    }
}
