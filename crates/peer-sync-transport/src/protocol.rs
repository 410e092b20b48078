//! Frame protocol for byte-stream transports.
//!
//! One JSON object per line. Every frame carries a `type` tag.

use peer_sync_core::WireMessage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frame error.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Invalid frame: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// A unit exchanged over a byte stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Sent once after activation; announces whether the app is installed.
    Hello { installed: bool },
    /// Immediate message expecting a reply with the same id.
    Message { id: Uuid, body: WireMessage },
    /// Reply to a `Message`.
    Reply { id: Uuid, body: WireMessage },
    /// Shared-context update.
    Context { body: WireMessage },
    /// Best-effort transfer.
    Transfer { body: WireMessage },
}

impl Frame {
    /// Encode as a single line, newline included.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_line(&self) -> Result<String, FrameError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one line. Surrounding whitespace is ignored.
    ///
    /// # Errors
    /// Returns error if the line is not a valid frame.
    pub fn from_line(line: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(line.trim())?)
    }
}
