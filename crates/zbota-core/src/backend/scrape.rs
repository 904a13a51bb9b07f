//! Backend scraping a vendor firmware download page.
//!
//! Download links follow the pattern
//! `<MFR>-<imageType>-<hwMin>-<hwMax>-<fileVersion>...ota.zigbee` with all
//! fields in hex. The first link in document order matching the device's
//! image type and hardware version wins.

use std::cmp::Ordering;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;

use super::{
    Backend, Fetcher, ImageMeta, compare_versions, download_and_parse, ensure_newer,
    validate_image,
};
use crate::error::OtaError;
use crate::identity::DeviceFirmwareIdentity;
use crate::image::Image;

fn link_pattern() -> Result<&'static Regex, OtaError> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(concat!(
                r#"(?i)[^"\s]*/([0-9a-f]{4})-([0-9a-f]{4})-"#,
                r"([0-9a-f]{4})-([0-9a-f]{4})-([0-9a-f]{8})\S*ota\.zigbee",
            ))
        })
        .as_ref()
        .map_err(|e| OtaError::InvalidIndex(e.to_string()))
}

/// A download link parsed from the firmware page.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FirmwareLink {
    href: String,
    manufacturer_code: u16,
    image_type: u16,
    hardware_version_min: u16,
    hardware_version_max: u16,
    file_version: u32,
}

fn parse_links(html: &str) -> Result<Vec<FirmwareLink>, OtaError> {
    let hex16 = |s: &str| u16::from_str_radix(s, 16).ok();
    let links = link_pattern()?
        .captures_iter(html)
        .filter_map(|c| {
            Some(FirmwareLink {
                href: c.get(0)?.as_str().to_string(),
                manufacturer_code: hex16(c.get(1)?.as_str())?,
                image_type: hex16(c.get(2)?.as_str())?,
                hardware_version_min: hex16(c.get(3)?.as_str())?,
                hardware_version_max: hex16(c.get(4)?.as_str())?,
                file_version: u32::from_str_radix(c.get(5)?.as_str(), 16).ok()?,
            })
        })
        .collect();
    Ok(links)
}

pub struct ScrapeBackend {
    page_url: String,
    manufacturer_code: u16,
    fetcher: Arc<dyn Fetcher>,
}

impl ScrapeBackend {
    pub fn new(page_url: &str, manufacturer_code: u16, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            page_url: page_url.to_string(),
            manufacturer_code,
            fetcher,
        }
    }

    /// Metadata of the first published image matching `identity`.
    pub async fn image_meta(
        &self,
        identity: &DeviceFirmwareIdentity,
    ) -> Result<Option<ImageMeta>, OtaError> {
        let Some(hardware_version) = identity.hardware_version else {
            tracing::warn!(identity = %identity, "Device did not report a hardware version");
            return Ok(None);
        };

        let body = self.fetcher.get(&self.page_url).await?;
        let html = String::from_utf8_lossy(&body);
        let links = parse_links(&html)?;
        tracing::debug!(links = links.len(), page = %self.page_url, "Scraped firmware page");

        let Some(link) = links.into_iter().find(|link| {
            link.manufacturer_code == self.manufacturer_code
                && link.image_type == identity.image_type
                && link.hardware_version_min <= hardware_version
                && hardware_version <= link.hardware_version_max
        }) else {
            return Ok(None);
        };

        let url = reqwest::Url::parse(&self.page_url)
            .and_then(|base| base.join(&link.href))
            .map_err(|e| OtaError::InvalidIndex(format!("link '{}': {}", link.href, e)))?;

        Ok(Some(ImageMeta {
            file_version: link.file_version,
            file_size: None,
            url: url.to_string(),
            sha512: None,
            sha256: None,
            hardware_version_min: Some(link.hardware_version_min),
            hardware_version_max: Some(link.hardware_version_max),
            force: false,
        }))
    }
}

#[async_trait]
impl Backend for ScrapeBackend {
    fn name(&self) -> &'static str {
        "ubisys"
    }

    async fn is_newer_available(
        &self,
        identity: &DeviceFirmwareIdentity,
    ) -> Result<Ordering, OtaError> {
        match self.image_meta(identity).await? {
            Some(meta) => Ok(compare_versions(identity, &meta)),
            None => Ok(Ordering::Equal),
        }
    }

    async fn fetch_image(&self, identity: &DeviceFirmwareIdentity) -> Result<Image, OtaError> {
        let meta = self.image_meta(identity).await?.ok_or_else(|| {
            OtaError::NoCandidate(format!(
                "no image for image type 0x{:04X} with hardware version {:?}",
                identity.image_type, identity.hardware_version
            ))
        })?;
        ensure_newer(identity, &meta)?;

        let image = download_and_parse(self.fetcher.as_ref(), &meta).await?;
        validate_image(&image, &meta, identity)?;

        let header = image.header();
        if header.manufacturer_code != self.manufacturer_code {
            return Err(OtaError::validation(
                "manufacturerCode",
                format!("0x{:04X}", self.manufacturer_code),
                format!("0x{:04X}", header.manufacturer_code),
            ));
        }
        Ok(image)
    }
}
