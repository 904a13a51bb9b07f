//! ZCL status codes used by the OTA Upgrade cluster.
//!
//! Devices report the outcome of an upgrade in `upgradeEndRequest.status`;
//! the server uses the same codes in its responses.

use std::fmt;

/// Status byte carried by OTA commands.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OtaStatus(u8);

impl OtaStatus {
    pub const SUCCESS: Self = Self(0x00);
    pub const NOT_AUTHORIZED: Self = Self(0x7E);
    pub const MALFORMED_COMMAND: Self = Self(0x80);
    pub const UNSUP_CLUSTER_COMMAND: Self = Self(0x81);
    pub const ABORT: Self = Self(0x95);
    pub const INVALID_IMAGE: Self = Self(0x96);
    pub const WAIT_FOR_DATA: Self = Self(0x97);
    pub const NO_IMAGE_AVAILABLE: Self = Self(0x98);
    pub const REQUIRE_MORE_IMAGE: Self = Self(0x99);

    pub const fn from_u8(value: u8) -> Self {
        Self(value)
    }

    /// Raw value.
    pub const fn value(&self) -> u8 {
        self.0
    }

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }

    /// Human-readable reason, `None` for codes outside the OTA table.
    pub fn reason(&self) -> Option<&'static str> {
        let reason = match *self {
            Self::SUCCESS => "success",
            Self::ABORT => "aborted by device",
            Self::NOT_AUTHORIZED => "not authorized",
            Self::INVALID_IMAGE => "invalid image",
            Self::WAIT_FOR_DATA => "no data available",
            Self::NO_IMAGE_AVAILABLE => "no image available",
            Self::MALFORMED_COMMAND => "malformed command",
            Self::UNSUP_CLUSTER_COMMAND => "unsupported cluster command",
            Self::REQUIRE_MORE_IMAGE => "requires more image files",
            _ => return None,
        };
        Some(reason)
    }
}

impl From<u8> for OtaStatus {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl fmt::Debug for OtaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OtaStatus(0x{:02X} '{}')", self.0, self)
    }
}

impl fmt::Display for OtaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{}", reason),
            None => write!(f, "unknown status 0x{:02X}", self.0),
        }
    }
}
