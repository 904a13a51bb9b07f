//! Protocol module - OTA Upgrade cluster definitions.

pub mod commands;
pub mod constants;
pub mod status;

pub use commands::{
    DefaultResponse, ImageBlockRequest, ImageBlockResponse, ImageNotify, ImagePageRequest,
    InboundCommand, InboundFrame, InboundKind, OutboundCommand, QueryNextImageRequest,
    QueryNextImageResponse, UpgradeEndRequest, UpgradeEndResponse,
};
pub use constants::*;
pub use status::OtaStatus;
