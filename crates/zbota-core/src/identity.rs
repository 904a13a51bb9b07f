//! Firmware identity reported by a device.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::{QUERY_FIELD_CONTROL_HARDWARE_VERSION, QueryNextImageRequest};

/// What a device says about its current firmware in `queryNextImageRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFirmwareIdentity {
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
    /// Only present when the device sets the hardware-version bit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_version: Option<u16>,
}

impl DeviceFirmwareIdentity {
    pub fn new(manufacturer_code: u16, image_type: u16, file_version: u32) -> Self {
        Self {
            manufacturer_code,
            image_type,
            file_version,
            hardware_version: None,
        }
    }

    pub fn with_hardware_version(mut self, hardware_version: u16) -> Self {
        self.hardware_version = Some(hardware_version);
        self
    }
}

impl From<&QueryNextImageRequest> for DeviceFirmwareIdentity {
    fn from(request: &QueryNextImageRequest) -> Self {
        Self {
            manufacturer_code: request.manufacturer_code,
            image_type: request.image_type,
            file_version: request.file_version,
            hardware_version: request
                .hardware_version
                .filter(|_| request.field_control & QUERY_FIELD_CONTROL_HARDWARE_VERSION != 0),
        }
    }
}

impl fmt::Display for DeviceFirmwareIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "manufacturer=0x{:04X} image_type=0x{:04X} file_version=0x{:08X}",
            self.manufacturer_code, self.image_type, self.file_version
        )?;
        if let Some(hw) = self.hardware_version {
            write!(f, " hardware_version={}", hw)?;
        }
        Ok(())
    }
}
