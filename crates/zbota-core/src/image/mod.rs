//! OTA image codec.
//!
//! Parses an upgrade file into its header and the flat sequence of tagged
//! sub-elements that follows it, enforcing that the declared
//! `total_image_size` accounts for every byte exactly.

mod header;
mod integrity;

pub use header::ImageHeader;
pub use integrity::{FirmwareFormat, detect_format, verify_image_data};

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use thiserror::Error;

use crate::protocol::constants::{SUB_ELEMENT_HEADER_SIZE, UPGRADE_FILE_IDENTIFIER};

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Not a valid OTA file: bad upgrade file identifier {found:02X?}")]
    BadMagic { found: [u8; 4] },
    #[error("OTA file truncated: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },
    #[error("Header length {header_length} is smaller than its fields ({minimum} bytes)")]
    InvalidHeaderLength { header_length: u16, minimum: usize },
    #[error("Image size mismatch: header declares {expected} bytes, content spans {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("Image too large: {size} bytes")]
    TooLarge { size: usize },
    #[error("{format} image CRC-32 is invalid (residue 0x{computed:08X})")]
    InvalidCrc {
        format: FirmwareFormat,
        computed: u32,
    },
    #[error("Image padding contains invalid bytes")]
    InvalidPadding,
    #[error("{format} image is truncated, no end tag found")]
    MissingEndTag { format: FirmwareFormat },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tagged, length-prefixed chunk of an image body.
#[derive(Clone, PartialEq, Eq)]
pub struct SubElement {
    pub tag_id: u16,
    pub data: Vec<u8>,
}

impl SubElement {
    pub fn new(tag_id: u16, data: Vec<u8>) -> Self {
        Self { tag_id, data }
    }

    /// Payload length as stored in the sub-element header.
    pub fn length(&self) -> usize {
        self.data.len()
    }

    /// Bytes occupied in the file, sub-element header included.
    pub fn encoded_len(&self) -> usize {
        SUB_ELEMENT_HEADER_SIZE + self.data.len()
    }
}

impl std::fmt::Debug for SubElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubElement")
            .field("tag_id", &format_args!("0x{:04X}", self.tag_id))
            .field("length", &self.data.len())
            .finish()
    }
}

/// Parsed OTA image. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    header: ImageHeader,
    elements: Vec<SubElement>,
    /// Original bytes, truncated to `total_image_size`.
    raw: Vec<u8>,
}

impl Image {
    /// Parse an OTA file starting at its upgrade file identifier.
    ///
    /// Bytes after `total_image_size` are ignored.
    pub fn parse(data: &[u8]) -> Result<Self, ImageError> {
        let header = ImageHeader::from_bytes(data)?;
        let total = header.total_image_size as usize;
        if data.len() < total {
            return Err(ImageError::SizeMismatch {
                expected: u64::from(header.total_image_size),
                actual: data.len() as u64,
            });
        }
        let raw = &data[..total];
        let start = usize::from(header.header_length);
        if start > total {
            return Err(ImageError::SizeMismatch {
                expected: u64::from(header.total_image_size),
                actual: start as u64,
            });
        }

        let mut elements = Vec::new();
        let mut position = start;
        while position < total {
            if position + SUB_ELEMENT_HEADER_SIZE > total {
                return Err(ImageError::SizeMismatch {
                    expected: total as u64,
                    actual: (position + SUB_ELEMENT_HEADER_SIZE) as u64,
                });
            }
            let mut cursor = Cursor::new(&raw[position..]);
            let tag_id = cursor.read_u16::<LittleEndian>()?;
            let length = cursor.read_u32::<LittleEndian>()? as usize;
            let data_start = position + SUB_ELEMENT_HEADER_SIZE;
            let data_end = data_start as u64 + length as u64;
            if data_end > total as u64 {
                return Err(ImageError::SizeMismatch {
                    expected: total as u64,
                    actual: data_end,
                });
            }
            let data_end = data_end as usize;
            elements.push(SubElement::new(tag_id, raw[data_start..data_end].to_vec()));
            position = data_end;
        }

        if position != total {
            return Err(ImageError::SizeMismatch {
                expected: total as u64,
                actual: position as u64,
            });
        }

        Ok(Self {
            header,
            elements,
            raw: raw.to_vec(),
        })
    }

    /// Build an image from a header and sub-elements.
    ///
    /// `header_length` and `total_image_size` are recomputed so the result
    /// satisfies the size invariant.
    pub fn assemble(
        mut header: ImageHeader,
        elements: Vec<SubElement>,
    ) -> Result<Self, ImageError> {
        let header_length = usize::from(header.header_length)
            .max(header.encoded_len() + header.header_padding.len());
        header.header_padding.resize(header_length - header.encoded_len(), 0);
        header.header_length =
            u16::try_from(header_length).map_err(|_| ImageError::TooLarge { size: header_length })?;
        let total: usize =
            header_length + elements.iter().map(SubElement::encoded_len).sum::<usize>();
        header.total_image_size =
            u32::try_from(total).map_err(|_| ImageError::TooLarge { size: total })?;

        let mut raw = header.to_bytes();
        for element in &elements {
            let length = u32::try_from(element.data.len()).map_err(|_| ImageError::TooLarge {
                size: element.data.len(),
            })?;
            raw.extend_from_slice(&element.tag_id.to_le_bytes());
            raw.extend_from_slice(&length.to_le_bytes());
            raw.extend_from_slice(&element.data);
        }

        Ok(Self {
            header,
            elements,
            raw,
        })
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    pub fn elements(&self) -> &[SubElement] {
        &self.elements
    }

    /// The image bytes sent to devices, exactly `total_image_size` long.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Re-serialize header and sub-elements.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.header.to_bytes();
        for element in &self.elements {
            out.extend_from_slice(&element.tag_id.to_le_bytes());
            out.extend_from_slice(&(element.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&element.data);
        }
        out
    }

    /// Slice of the image served for a block request at `offset`.
    ///
    /// Clamped to the end of the image; empty when `offset` is past the end.
    pub fn block(&self, offset: u32, max_len: usize) -> &[u8] {
        let start = (offset as usize).min(self.raw.len());
        let end = start.saturating_add(max_len).min(self.raw.len());
        &self.raw[start..end]
    }
}

/// Offset of the upgrade file identifier in `data`.
///
/// Some vendors wrap the OTA file in their own container; parsing starts at
/// the identifier.
pub fn find_image_start(data: &[u8]) -> Option<usize> {
    data.windows(UPGRADE_FILE_IDENTIFIER.len())
        .position(|window| window == UPGRADE_FILE_IDENTIFIER)
}
