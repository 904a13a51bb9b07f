//! JSON index backends.
//!
//! Three index shapes are supported:
//! - `Catalog`: a community catalog, one JSON array of image entries.
//! - `Ledvance` / `Osram`: the vendor update API, queried per
//!   manufacturer and image type. The two brands differ only in how the
//!   file version is derived from the response.

use std::cmp::Ordering;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use super::{
    Backend, Fetcher, ImageMeta, compare_versions, download_and_parse, ensure_newer,
    validate_image,
};
use crate::error::OtaError;
use crate::identity::DeviceFirmwareIdentity;
use crate::image::Image;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    Catalog,
    Ledvance,
    Osram,
}

/// One entry of the community catalog.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogEntry {
    file_version: u32,
    #[serde(default)]
    file_size: Option<u32>,
    url: String,
    image_type: u16,
    manufacturer_code: u16,
    #[serde(default)]
    sha512: Option<String>,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    min_file_version: Option<u32>,
    #[serde(default)]
    max_file_version: Option<u32>,
    #[serde(default)]
    hardware_version_min: Option<u16>,
    #[serde(default)]
    hardware_version_max: Option<u16>,
    #[serde(default)]
    manufacturer_name: Option<Vec<String>>,
}

impl CatalogEntry {
    fn matches(&self, identity: &DeviceFirmwareIdentity, manufacturer_name: Option<&str>) -> bool {
        if self.image_type != identity.image_type
            || self.manufacturer_code != identity.manufacturer_code
        {
            return false;
        }
        if self.min_file_version.is_some_and(|min| identity.file_version < min)
            || self.max_file_version.is_some_and(|max| identity.file_version > max)
        {
            return false;
        }
        if self.hardware_version_min.is_some() || self.hardware_version_max.is_some() {
            let Some(hw) = identity.hardware_version else {
                return false;
            };
            if self.hardware_version_min.is_some_and(|min| hw < min)
                || self.hardware_version_max.is_some_and(|max| hw > max)
            {
                return false;
            }
        }
        if let Some(names) = &self.manufacturer_name {
            match manufacturer_name {
                Some(name) => names.iter().any(|n| n == name),
                None => false,
            }
        } else {
            true
        }
    }

    fn to_meta(&self) -> ImageMeta {
        ImageMeta {
            file_version: self.file_version,
            file_size: self.file_size,
            url: self.url.clone(),
            sha512: self.sha512.clone(),
            sha256: self.sha256.clone(),
            hardware_version_min: self.hardware_version_min,
            hardware_version_max: self.hardware_version_max,
            force: self.force,
        }
    }
}

#[derive(Debug, Deserialize)]
struct VendorResponse {
    #[serde(default)]
    firmwares: Vec<VendorFirmware>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VendorFirmware {
    identity: VendorIdentity,
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    length: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct VendorIdentity {
    company: u16,
    product: u16,
    version: VendorVersion,
}

#[derive(Debug, Deserialize)]
struct VendorVersion {
    major: u32,
    minor: u32,
    build: u32,
}

impl VendorVersion {
    /// The decimal number `major*100000 + minor*1000 + build`, read as hex.
    fn as_packed_hex(&self) -> Result<u32, OtaError> {
        let digits = self
            .major
            .checked_mul(100_000)
            .and_then(|v| v.checked_add(self.minor.checked_mul(1000)?))
            .and_then(|v| v.checked_add(self.build))
            .ok_or_else(|| OtaError::InvalidIndex(format!("version {} out of range", self)))?;
        u32::from_str_radix(&digits.to_string(), 16)
            .map_err(|e| OtaError::InvalidIndex(format!("version {}: {}", self, e)))
    }
}

impl std::fmt::Display for VendorVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

/// Matches the `/<digits>/` path segment carrying the file version.
fn version_segment_pattern() -> Result<&'static Regex, OtaError> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"/(\d+)/"))
        .as_ref()
        .map_err(|e| OtaError::InvalidIndex(e.to_string()))
}

fn file_version_from_full_name(full_name: &str) -> Result<u32, OtaError> {
    let digits = version_segment_pattern()?
        .captures(full_name)
        .and_then(|c| c.get(1))
        .ok_or_else(|| OtaError::InvalidIndex(format!("no file version in '{}'", full_name)))?;
    u32::from_str_radix(digits.as_str(), 16)
        .map_err(|e| OtaError::InvalidIndex(format!("file version in '{}': {}", full_name, e)))
}

/// Backend reading image metadata from a JSON index.
pub struct IndexBackend {
    format: IndexFormat,
    base_url: String,
    manufacturer_name: Option<String>,
    fetcher: Arc<dyn Fetcher>,
}

impl IndexBackend {
    pub fn new(format: IndexFormat, base_url: &str, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            format,
            base_url: base_url.trim_end_matches('/').to_string(),
            manufacturer_name: None,
            fetcher,
        }
    }

    /// Manufacturer name used for catalog entries restricted by name.
    pub fn with_manufacturer_name(mut self, name: impl Into<String>) -> Self {
        self.manufacturer_name = Some(name.into());
        self
    }

    /// Metadata of the newest image for `identity`, if any is published.
    pub async fn image_meta(
        &self,
        identity: &DeviceFirmwareIdentity,
    ) -> Result<Option<ImageMeta>, OtaError> {
        match self.format {
            IndexFormat::Catalog => self.catalog_meta(identity).await,
            IndexFormat::Ledvance | IndexFormat::Osram => self.vendor_meta(identity).await,
        }
    }

    async fn catalog_meta(
        &self,
        identity: &DeviceFirmwareIdentity,
    ) -> Result<Option<ImageMeta>, OtaError> {
        let body = self.fetcher.get(&self.base_url).await?;
        let entries: Vec<CatalogEntry> = serde_json::from_slice(&body)?;
        tracing::debug!(entries = entries.len(), "Downloaded catalog index");

        Ok(entries
            .iter()
            .find(|entry| entry.matches(identity, self.manufacturer_name.as_deref()))
            .map(CatalogEntry::to_meta))
    }

    async fn vendor_meta(
        &self,
        identity: &DeviceFirmwareIdentity,
    ) -> Result<Option<ImageMeta>, OtaError> {
        let url = format!(
            "{}/newer?company={}&product={}&version=0.0.0",
            self.base_url, identity.manufacturer_code, identity.image_type
        );
        let body = self.fetcher.get(&url).await?;
        let response: VendorResponse = serde_json::from_slice(&body)?;
        let Some(firmware) = response.firmwares.into_iter().next() else {
            return Ok(None);
        };

        let file_version = match self.format {
            IndexFormat::Osram => firmware.identity.version.as_packed_hex()?,
            _ => {
                let full_name = firmware.full_name.as_deref().ok_or_else(|| {
                    OtaError::InvalidIndex("firmware entry without fullName".to_string())
                })?;
                file_version_from_full_name(full_name)?
            }
        };

        Ok(Some(ImageMeta {
            file_version,
            file_size: firmware.length,
            url: format!(
                "{}/download?company={}&product={}&version={}",
                self.base_url,
                firmware.identity.company,
                firmware.identity.product,
                firmware.identity.version
            ),
            sha512: None,
            sha256: None,
            hardware_version_min: None,
            hardware_version_max: None,
            force: false,
        }))
    }

    fn no_candidate(&self, identity: &DeviceFirmwareIdentity) -> OtaError {
        OtaError::NoCandidate(format!(
            "no {} image for manufacturer 0x{:04X} image type 0x{:04X}",
            self.name(),
            identity.manufacturer_code,
            identity.image_type
        ))
    }
}

#[async_trait]
impl Backend for IndexBackend {
    fn name(&self) -> &'static str {
        match self.format {
            IndexFormat::Catalog => "catalog",
            IndexFormat::Ledvance => "ledvance",
            IndexFormat::Osram => "osram",
        }
    }

    async fn is_newer_available(
        &self,
        identity: &DeviceFirmwareIdentity,
    ) -> Result<Ordering, OtaError> {
        match self.image_meta(identity).await? {
            Some(meta) => {
                tracing::debug!(
                    current = %format!("0x{:08X}", identity.file_version),
                    latest = %format!("0x{:08X}", meta.file_version),
                    "Compared against index"
                );
                Ok(compare_versions(identity, &meta))
            }
            None => {
                tracing::debug!(identity = %identity, "Images currently unavailable");
                Ok(Ordering::Equal)
            }
        }
    }

    async fn fetch_image(&self, identity: &DeviceFirmwareIdentity) -> Result<Image, OtaError> {
        let meta = self
            .image_meta(identity)
            .await?
            .ok_or_else(|| self.no_candidate(identity))?;
        ensure_newer(identity, &meta)?;

        let image = download_and_parse(self.fetcher.as_ref(), &meta).await?;
        validate_image(&image, &meta, identity)?;
        Ok(image)
    }
}
