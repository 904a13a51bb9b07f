use std::cmp::Ordering;

use async_trait::async_trait;

use super::Backend;
use crate::error::OtaError;
use crate::identity::DeviceFirmwareIdentity;
use crate::image::Image;

/// Backend for manufacturers without a known distribution channel.
pub struct NoopBackend;

#[async_trait]
impl Backend for NoopBackend {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn is_newer_available(
        &self,
        _identity: &DeviceFirmwareIdentity,
    ) -> Result<Ordering, OtaError> {
        Ok(Ordering::Equal)
    }

    async fn fetch_image(&self, identity: &DeviceFirmwareIdentity) -> Result<Image, OtaError> {
        Err(OtaError::NoCandidate(format!(
            "no firmware source for manufacturer 0x{:04X}",
            identity.manufacturer_code
        )))
    }
}
