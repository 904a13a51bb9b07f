//! OTA upgrade file header.
//!
//! Layout (little-endian):
//!
//! | Offset | Size | Field                      |
//! |--------|------|----------------------------|
//! | 0      | 4    | upgrade file identifier    |
//! | 4      | 2    | header version             |
//! | 6      | 2    | header length              |
//! | 8      | 2    | field control              |
//! | 10     | 2    | manufacturer code          |
//! | 12     | 2    | image type                 |
//! | 14     | 4    | file version               |
//! | 18     | 2    | zigbee stack version       |
//! | 20     | 32   | header string              |
//! | 52     | 4    | total image size           |
//! | 56     | ...  | optional fields (see `field_control`) |

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

use super::ImageError;
use crate::protocol::constants::{
    FIELD_CONTROL_DEVICE_SPECIFIC, FIELD_CONTROL_HARDWARE_VERSIONS,
    FIELD_CONTROL_SECURITY_CREDENTIAL, FIXED_HEADER_SIZE, HEADER_STRING_LEN,
    UPGRADE_FILE_DESTINATION_LEN, UPGRADE_FILE_IDENTIFIER,
};

/// Parsed OTA file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub header_version: u16,
    /// Offset at which sub-elements begin.
    pub header_length: u16,
    pub field_control: u16,
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
    pub stack_version: u16,
    /// Raw 32-byte header string, usually ASCII padded with NUL or spaces.
    pub header_string: [u8; HEADER_STRING_LEN],
    pub total_image_size: u32,
    pub security_credential_version: Option<u8>,
    pub upgrade_file_destination: Option<[u8; UPGRADE_FILE_DESTINATION_LEN]>,
    pub hardware_version_min: Option<u16>,
    pub hardware_version_max: Option<u16>,
    /// Bytes between the last header field and `header_length`, kept as is.
    pub header_padding: Vec<u8>,
}

impl ImageHeader {
    /// Header version defined by the OTA specification.
    pub const DEFAULT_HEADER_VERSION: u16 = 0x0100;
    /// Zigbee PRO stack version.
    pub const DEFAULT_STACK_VERSION: u16 = 0x0002;

    /// Header without optional fields; sizes are filled in by
    /// [`Image::assemble`](super::Image::assemble).
    pub fn new(manufacturer_code: u16, image_type: u16, file_version: u32) -> Self {
        Self {
            header_version: Self::DEFAULT_HEADER_VERSION,
            header_length: FIXED_HEADER_SIZE as u16,
            field_control: 0,
            manufacturer_code,
            image_type,
            file_version,
            stack_version: Self::DEFAULT_STACK_VERSION,
            header_string: [0; HEADER_STRING_LEN],
            total_image_size: 0,
            security_credential_version: None,
            upgrade_file_destination: None,
            hardware_version_min: None,
            hardware_version_max: None,
            header_padding: Vec::new(),
        }
    }

    /// Set the header string, truncated to 32 bytes and NUL padded.
    pub fn with_header_string(mut self, text: &str) -> Self {
        let mut buf = [0u8; HEADER_STRING_LEN];
        let len = text.len().min(HEADER_STRING_LEN);
        buf[..len].copy_from_slice(&text.as_bytes()[..len]);
        self.header_string = buf;
        self
    }

    /// Attach a hardware version range and set the matching field-control bit.
    pub fn with_hardware_versions(mut self, min: u16, max: u16) -> Self {
        self.field_control |= FIELD_CONTROL_HARDWARE_VERSIONS;
        self.hardware_version_min = Some(min);
        self.hardware_version_max = Some(max);
        self
    }

    /// Header string as text, trailing NULs removed.
    pub fn header_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.header_string)
            .trim_end_matches('\0')
            .to_string()
    }

    /// Number of bytes the fixed and conditional fields occupy.
    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER_SIZE + optional_fields_len(self.field_control)
    }

    /// Whether `hardware_version` falls inside the header's hardware range.
    ///
    /// Returns `None` when the header carries no range.
    pub fn hardware_version_in_range(&self, hardware_version: u16) -> Option<bool> {
        match (self.hardware_version_min, self.hardware_version_max) {
            (Some(min), Some(max)) => Some(min <= hardware_version && hardware_version <= max),
            _ => None,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ImageError> {
        if data.len() < UPGRADE_FILE_IDENTIFIER.len() {
            return Err(ImageError::Truncated {
                needed: UPGRADE_FILE_IDENTIFIER.len(),
                available: data.len(),
            });
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[..4]);
        if magic != UPGRADE_FILE_IDENTIFIER {
            return Err(ImageError::BadMagic { found: magic });
        }
        if data.len() < FIXED_HEADER_SIZE {
            return Err(ImageError::Truncated {
                needed: FIXED_HEADER_SIZE,
                available: data.len(),
            });
        }

        let mut cursor = Cursor::new(&data[4..]);
        let header_version = cursor.read_u16::<LittleEndian>()?;
        let header_length = cursor.read_u16::<LittleEndian>()?;
        let field_control = cursor.read_u16::<LittleEndian>()?;
        let manufacturer_code = cursor.read_u16::<LittleEndian>()?;
        let image_type = cursor.read_u16::<LittleEndian>()?;
        let file_version = cursor.read_u32::<LittleEndian>()?;
        let stack_version = cursor.read_u16::<LittleEndian>()?;
        let mut header_string = [0u8; HEADER_STRING_LEN];
        cursor.read_exact(&mut header_string)?;
        let total_image_size = cursor.read_u32::<LittleEndian>()?;

        let needed = FIXED_HEADER_SIZE + optional_fields_len(field_control);
        if data.len() < needed {
            return Err(ImageError::Truncated {
                needed,
                available: data.len(),
            });
        }

        let security_credential_version = if field_control & FIELD_CONTROL_SECURITY_CREDENTIAL != 0
        {
            Some(cursor.read_u8()?)
        } else {
            None
        };
        let upgrade_file_destination = if field_control & FIELD_CONTROL_DEVICE_SPECIFIC != 0 {
            let mut dest = [0u8; UPGRADE_FILE_DESTINATION_LEN];
            cursor.read_exact(&mut dest)?;
            Some(dest)
        } else {
            None
        };
        let (hardware_version_min, hardware_version_max) =
            if field_control & FIELD_CONTROL_HARDWARE_VERSIONS != 0 {
                (
                    Some(cursor.read_u16::<LittleEndian>()?),
                    Some(cursor.read_u16::<LittleEndian>()?),
                )
            } else {
                (None, None)
            };

        if usize::from(header_length) < needed {
            return Err(ImageError::InvalidHeaderLength {
                header_length,
                minimum: needed,
            });
        }
        let padding_end = usize::from(header_length);
        if data.len() < padding_end {
            return Err(ImageError::Truncated {
                needed: padding_end,
                available: data.len(),
            });
        }

        Ok(Self {
            header_version,
            header_length,
            field_control,
            manufacturer_code,
            image_type,
            file_version,
            stack_version,
            header_string,
            total_image_size,
            security_credential_version,
            upgrade_file_destination,
            hardware_version_min,
            hardware_version_max,
            header_padding: data[needed..padding_end].to_vec(),
        })
    }

    /// Serialize the header followed by its padding, zero-filled up to
    /// `header_length` if the padding is short.
    pub fn to_bytes(&self) -> Vec<u8> {
        let len = usize::from(self.header_length).max(self.encoded_len());
        let mut buf = Vec::with_capacity(len);
        buf.extend_from_slice(&UPGRADE_FILE_IDENTIFIER);
        buf.extend_from_slice(&self.header_version.to_le_bytes());
        buf.extend_from_slice(&self.header_length.to_le_bytes());
        buf.extend_from_slice(&self.field_control.to_le_bytes());
        buf.extend_from_slice(&self.manufacturer_code.to_le_bytes());
        buf.extend_from_slice(&self.image_type.to_le_bytes());
        buf.extend_from_slice(&self.file_version.to_le_bytes());
        buf.extend_from_slice(&self.stack_version.to_le_bytes());
        buf.extend_from_slice(&self.header_string);
        buf.extend_from_slice(&self.total_image_size.to_le_bytes());
        if self.field_control & FIELD_CONTROL_SECURITY_CREDENTIAL != 0 {
            buf.push(self.security_credential_version.unwrap_or_default());
        }
        if self.field_control & FIELD_CONTROL_DEVICE_SPECIFIC != 0 {
            buf.extend_from_slice(&self.upgrade_file_destination.unwrap_or_default());
        }
        if self.field_control & FIELD_CONTROL_HARDWARE_VERSIONS != 0 {
            buf.extend_from_slice(&self.hardware_version_min.unwrap_or_default().to_le_bytes());
            buf.extend_from_slice(&self.hardware_version_max.unwrap_or_default().to_le_bytes());
        }
        buf.extend_from_slice(&self.header_padding);
        buf.resize(len, 0);
        buf
    }
}

fn optional_fields_len(field_control: u16) -> usize {
    let mut len = 0;
    if field_control & FIELD_CONTROL_SECURITY_CREDENTIAL != 0 {
        len += 1;
    }
    if field_control & FIELD_CONTROL_DEVICE_SPECIFIC != 0 {
        len += UPGRADE_FILE_DESTINATION_LEN;
    }
    if field_control & FIELD_CONTROL_HARDWARE_VERSIONS != 0 {
        len += 4;
    }
    len
}
