//! Integrity checks for Silicon Labs firmware inside OTA sub-elements.
//!
//! EBL and GBL images end with a tag carrying a CRC-32 over everything
//! before it. Running the CRC over the data including the stored value
//! yields a fixed residue when the image is intact. EBL images may be
//! followed by `0xFF` padding only.

use super::{Image, ImageError};

/// CRC-32 residue of an intact image.
const VALID_SILABS_CRC: u32 = 0x2144_DF1C;

const EBL_TAG_HEADER: u16 = 0x0000;
const EBL_TAG_ENC_HEADER: u16 = 0xFB05;
const EBL_TAG_END: u16 = 0xFC04;
const EBL_PADDING: u8 = 0xFF;
const EBL_IMAGE_SIGNATURE: u16 = 0xE350;

const GBL_TAG_HEADER: u32 = 0xEB17_A603;
const GBL_TAG_END: u32 = 0xFC04_04FC;

/// Container format of a sub-element payload, if recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareFormat {
    Ebl,
    Gbl,
}

impl std::fmt::Display for FirmwareFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FirmwareFormat::Ebl => write!(f, "EBL"),
            FirmwareFormat::Gbl => write!(f, "GBL"),
        }
    }
}

fn be16(data: &[u8], at: usize) -> Option<u16> {
    let bytes = data.get(at..at + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn be32(data: &[u8], at: usize) -> Option<u32> {
    let bytes = data.get(at..at + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn le32(data: &[u8], at: usize) -> Option<u32> {
    let bytes = data.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Recognize a Silicon Labs firmware container by its leading tag.
pub fn detect_format(data: &[u8]) -> Option<FirmwareFormat> {
    if be32(data, 0) == Some(GBL_TAG_HEADER) {
        return Some(FirmwareFormat::Gbl);
    }
    match be16(data, 0)? {
        EBL_TAG_HEADER if be16(data, 6) == Some(EBL_IMAGE_SIGNATURE) => Some(FirmwareFormat::Ebl),
        EBL_TAG_ENC_HEADER => Some(FirmwareFormat::Ebl),
        _ => None,
    }
}

/// Check every sub-element holding EBL or GBL firmware.
///
/// Sub-elements in other formats are not inspected.
pub fn verify_image_data(image: &Image) -> Result<(), ImageError> {
    for element in image.elements() {
        match detect_format(&element.data) {
            Some(FirmwareFormat::Ebl) => verify_ebl(&element.data)?,
            Some(FirmwareFormat::Gbl) => verify_gbl(&element.data)?,
            None => {}
        }
    }
    Ok(())
}

fn verify_ebl(data: &[u8]) -> Result<(), ImageError> {
    let mut position = 0usize;
    while let (Some(tag), Some(len)) = (be16(data, position), be16(data, position + 2)) {
        position += 4 + usize::from(len);
        if tag != EBL_TAG_END {
            continue;
        }
        let end = position.min(data.len());
        if data[end..].iter().any(|&b| b != EBL_PADDING) {
            return Err(ImageError::InvalidPadding);
        }
        return check_crc(FirmwareFormat::Ebl, &data[..end]);
    }
    Err(ImageError::MissingEndTag {
        format: FirmwareFormat::Ebl,
    })
}

fn verify_gbl(data: &[u8]) -> Result<(), ImageError> {
    let mut position = 0usize;
    while let (Some(tag), Some(len)) = (be32(data, position), le32(data, position + 4)) {
        position = position.saturating_add(8).saturating_add(len as usize);
        if tag != GBL_TAG_END {
            continue;
        }
        return check_crc(FirmwareFormat::Gbl, &data[..position.min(data.len())]);
    }
    Err(ImageError::MissingEndTag {
        format: FirmwareFormat::Gbl,
    })
}

fn check_crc(format: FirmwareFormat, covered: &[u8]) -> Result<(), ImageError> {
    let computed = crc32fast::hash(covered);
    if computed != VALID_SILABS_CRC {
        return Err(ImageError::InvalidCrc { format, computed });
    }
    Ok(())
}
