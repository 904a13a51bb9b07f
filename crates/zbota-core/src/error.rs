//! Error taxonomy for OTA operations.

use std::time::Duration;

use thiserror::Error;

use crate::backend::FetchError;
use crate::image::ImageError;
use crate::protocol::InboundKind;
use crate::transport::TransportError;
use crate::waiter::WaitError;

#[derive(Error, Debug)]
pub enum OtaError {
    /// Structurally invalid image (bad magic, size mismatch, truncation).
    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("Failed to find an endpoint which supports the OTA cluster on {ieee_address}")]
    NoOtaEndpoint { ieee_address: String },

    #[error("Device didn't send {command} within {timeout:?}")]
    NoResponse {
        command: InboundKind,
        timeout: Duration,
    },

    #[error("Transfer stalled: no imageBlockRequest within {timeout:?} (last offset {offset})")]
    Stalled { offset: u32, timeout: Duration },

    #[error("No image available: {0}")]
    NoCandidate(String),

    #[error("No new image available: current 0x{current:08X}, latest 0x{latest:08X}")]
    VersionMismatch { current: u32, latest: u32 },

    /// Fetched bytes do not match the metadata they were advertised with.
    #[error("Image validation failed: {field} mismatch (expected {expected}, got {actual})")]
    ValidationFailed {
        field: &'static str,
        expected: String,
        actual: String,
    },

    #[error("Update failed with reason: {reason} (status 0x{status:02X})")]
    DeviceRejected { status: u8, reason: String },

    #[error("Update canceled")]
    Canceled,

    #[error("Invalid firmware index: {0}")]
    InvalidIndex(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),
}

impl OtaError {
    /// Whether the device stopped responding at some protocol step.
    pub fn is_timeout(&self) -> bool {
        matches!(self, OtaError::NoResponse { .. } | OtaError::Stalled { .. })
    }

    pub(crate) fn validation(
        field: &'static str,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        OtaError::ValidationFailed {
            field,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

impl From<WaitError> for OtaError {
    fn from(e: WaitError) -> Self {
        match e {
            WaitError::Timeout { kind, timeout } => OtaError::NoResponse {
                command: kind,
                timeout,
            },
            WaitError::Canceled { .. } => OtaError::Canceled,
            WaitError::Transport(e) => OtaError::Transport(e),
        }
    }
}

impl From<serde_json::Error> for OtaError {
    fn from(e: serde_json::Error) -> Self {
        OtaError::InvalidIndex(e.to_string())
    }
}
