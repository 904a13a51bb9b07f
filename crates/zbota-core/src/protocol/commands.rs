//! Typed payloads for the OTA Upgrade cluster commands.
//!
//! Inbound commands are client-to-server requests sent by the device being
//! upgraded; outbound commands are the server's notifications and responses.

use std::fmt;

use super::constants::{
    IMAGE_NOTIFY_PAYLOAD_TYPE_JITTER, IMAGE_NOTIFY_QUERY_JITTER, OTA_CLUSTER_ID,
    UPGRADE_END_CURRENT_TIME, UPGRADE_END_REQUEST_ID, UPGRADE_END_UPGRADE_TIME,
};
use super::status::OtaStatus;
use crate::image::Image;

/// `imageNotify` (server -> client).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageNotify {
    pub payload_type: u8,
    pub query_jitter: u8,
}

impl Default for ImageNotify {
    fn default() -> Self {
        Self {
            payload_type: IMAGE_NOTIFY_PAYLOAD_TYPE_JITTER,
            query_jitter: IMAGE_NOTIFY_QUERY_JITTER,
        }
    }
}

/// `queryNextImageRequest` (client -> server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryNextImageRequest {
    pub field_control: u8,
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
    /// Present when bit 0 of `field_control` is set.
    pub hardware_version: Option<u16>,
}

/// `queryNextImageResponse` (server -> client).
///
/// Only `status` is meaningful when the status is not success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryNextImageResponse {
    pub status: OtaStatus,
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
    pub image_size: u32,
}

impl QueryNextImageResponse {
    pub fn for_image(image: &Image) -> Self {
        let header = image.header();
        Self {
            status: OtaStatus::SUCCESS,
            manufacturer_code: header.manufacturer_code,
            image_type: header.image_type,
            file_version: header.file_version,
            image_size: header.total_image_size,
        }
    }

    pub fn no_image_available() -> Self {
        Self {
            status: OtaStatus::NO_IMAGE_AVAILABLE,
            manufacturer_code: 0,
            image_type: 0,
            file_version: 0,
            image_size: 0,
        }
    }
}

/// `imageBlockRequest` (client -> server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBlockRequest {
    pub field_control: u8,
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
    pub file_offset: u32,
    pub maximum_data_size: u8,
}

/// `imagePageRequest` (client -> server).
///
/// Asks for `page_size` bytes from `file_offset`, delivered as a series of
/// `imageBlockResponse`s of at most `maximum_data_size` bytes each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImagePageRequest {
    pub field_control: u8,
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
    pub file_offset: u32,
    pub maximum_data_size: u8,
    pub page_size: u16,
    /// Requested spacing between responses in milliseconds. The session's
    /// own pacing applies instead.
    pub response_spacing: u16,
    /// Present when bit 0 of `field_control` is set.
    pub request_node_address: Option<[u8; 8]>,
}

impl ImagePageRequest {
    /// The block request equivalent to the start of the page.
    pub fn first_block(&self) -> ImageBlockRequest {
        ImageBlockRequest {
            field_control: 0,
            manufacturer_code: self.manufacturer_code,
            image_type: self.image_type,
            file_version: self.file_version,
            file_offset: self.file_offset,
            maximum_data_size: self.maximum_data_size,
        }
    }
}

/// `imageBlockResponse` (server -> client).
#[derive(Clone, PartialEq, Eq)]
pub struct ImageBlockResponse {
    pub status: OtaStatus,
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
    pub file_offset: u32,
    pub data_size: u8,
    pub data: Vec<u8>,
}

impl fmt::Debug for ImageBlockResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageBlockResponse")
            .field("status", &self.status)
            .field("manufacturer_code", &self.manufacturer_code)
            .field("image_type", &self.image_type)
            .field("file_version", &self.file_version)
            .field("file_offset", &self.file_offset)
            .field("data_size", &self.data_size)
            .finish_non_exhaustive()
    }
}

/// `upgradeEndRequest` (client -> server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeEndRequest {
    pub status: OtaStatus,
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
}

/// `upgradeEndResponse` (server -> client).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeEndResponse {
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
    pub current_time: u32,
    pub upgrade_time: u32,
}

impl UpgradeEndResponse {
    /// Response telling the device to apply `image` immediately.
    pub fn upgrade_now(image: &Image) -> Self {
        let header = image.header();
        Self {
            manufacturer_code: header.manufacturer_code,
            image_type: header.image_type,
            file_version: header.file_version,
            current_time: UPGRADE_END_CURRENT_TIME,
            upgrade_time: UPGRADE_END_UPGRADE_TIME,
        }
    }
}

/// ZCL default response, acknowledging a cluster command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultResponse {
    pub cluster_id: u16,
    pub command_id: u8,
    pub status: OtaStatus,
}

impl DefaultResponse {
    /// Acknowledges an `upgradeEndRequest` that reported a failure, so the
    /// device restarts the upgrade on its own terms.
    pub fn upgrade_end_acknowledged() -> Self {
        Self {
            cluster_id: OTA_CLUSTER_ID,
            command_id: UPGRADE_END_REQUEST_ID,
            status: OtaStatus::SUCCESS,
        }
    }
}

/// Commands the engine sends to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundCommand {
    ImageNotify(ImageNotify),
    QueryNextImageResponse(QueryNextImageResponse),
    ImageBlockResponse(ImageBlockResponse),
    UpgradeEndResponse(UpgradeEndResponse),
    DefaultResponse(DefaultResponse),
}

impl OutboundCommand {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundCommand::ImageNotify(_) => "imageNotify",
            OutboundCommand::QueryNextImageResponse(_) => "queryNextImageResponse",
            OutboundCommand::ImageBlockResponse(_) => "imageBlockResponse",
            OutboundCommand::UpgradeEndResponse(_) => "upgradeEndResponse",
            OutboundCommand::DefaultResponse(_) => "defaultResponse",
        }
    }
}

/// Names of the commands the engine waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboundKind {
    QueryNextImageRequest,
    ImageBlockRequest,
    ImagePageRequest,
    UpgradeEndRequest,
}

impl fmt::Display for InboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboundKind::QueryNextImageRequest => write!(f, "queryNextImageRequest"),
            InboundKind::ImageBlockRequest => write!(f, "imageBlockRequest"),
            InboundKind::ImagePageRequest => write!(f, "imagePageRequest"),
            InboundKind::UpgradeEndRequest => write!(f, "upgradeEndRequest"),
        }
    }
}

/// Commands received from a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundCommand {
    QueryNextImageRequest(QueryNextImageRequest),
    ImageBlockRequest(ImageBlockRequest),
    ImagePageRequest(ImagePageRequest),
    UpgradeEndRequest(UpgradeEndRequest),
}

impl InboundCommand {
    pub fn kind(&self) -> InboundKind {
        match self {
            InboundCommand::QueryNextImageRequest(_) => InboundKind::QueryNextImageRequest,
            InboundCommand::ImageBlockRequest(_) => InboundKind::ImageBlockRequest,
            InboundCommand::ImagePageRequest(_) => InboundKind::ImagePageRequest,
            InboundCommand::UpgradeEndRequest(_) => InboundKind::UpgradeEndRequest,
        }
    }
}

/// An inbound command together with its ZCL transaction sequence number.
///
/// Responses echo the sequence number of the request they answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundFrame {
    pub transaction_sequence_number: Option<u8>,
    pub command: InboundCommand,
}

impl InboundFrame {
    pub fn new(command: InboundCommand) -> Self {
        Self {
            transaction_sequence_number: None,
            command,
        }
    }

    pub fn with_tsn(command: InboundCommand, tsn: u8) -> Self {
        Self {
            transaction_sequence_number: Some(tsn),
            command,
        }
    }
}
