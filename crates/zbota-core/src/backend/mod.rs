//! Firmware backends.
//!
//! A backend knows where one vendor publishes firmware. It answers whether
//! something newer than a device's current image exists and fetches that
//! image, validated against what the device and the distribution channel
//! claim about it.

pub mod fetch;
pub mod index;
pub mod noop;
pub mod scrape;

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use crate::error::OtaError;
use crate::identity::DeviceFirmwareIdentity;
use crate::image::{Image, find_image_start, verify_image_data};
use crate::session::SessionConfig;

pub use fetch::{FetchError, Fetcher, HttpFetcher, StaticFetcher};
pub use index::{IndexBackend, IndexFormat};
pub use noop::NoopBackend;
pub use scrape::ScrapeBackend;

pub const DEFAULT_CATALOG_INDEX_URL: &str =
    "https://raw.githubusercontent.com/Koenkk/zigbee-OTA/master/index.json";
pub const DEFAULT_VENDOR_API_URL: &str = "https://api.update.ledvance.com/v1/zigbee/firmwares";
pub const DEFAULT_UBISYS_FIRMWARE_URL: &str = "https://www.ubisys.de/en/support/firmware/";

pub const UBISYS_MANUFACTURER_CODE: u16 = 0x10F2;

/// A source of firmware images for one family of devices.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Compare the device's firmware with the newest published image.
    ///
    /// `Less` means a newer image is available, `Greater` means the device
    /// runs something newer than anything published.
    async fn is_newer_available(
        &self,
        identity: &DeviceFirmwareIdentity,
    ) -> Result<Ordering, OtaError>;

    /// Download and validate the newest image for the device.
    async fn fetch_image(&self, identity: &DeviceFirmwareIdentity) -> Result<Image, OtaError>;
}

/// What a distribution channel says about a candidate image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMeta {
    pub file_version: u32,
    pub file_size: Option<u32>,
    pub url: String,
    pub sha512: Option<String>,
    /// Only consulted when no SHA-512 is published.
    pub sha256: Option<String>,
    pub hardware_version_min: Option<u16>,
    pub hardware_version_max: Option<u16>,
    /// Offer the image even when it is not newer than the device's.
    pub force: bool,
}

/// Ordering of the device's version relative to `meta`.
pub(crate) fn compare_versions(identity: &DeviceFirmwareIdentity, meta: &ImageMeta) -> Ordering {
    if meta.force {
        return Ordering::Less;
    }
    identity.file_version.cmp(&meta.file_version)
}

/// Refuse to fetch anything that is not strictly newer, unless forced.
pub(crate) fn ensure_newer(
    identity: &DeviceFirmwareIdentity,
    meta: &ImageMeta,
) -> Result<(), OtaError> {
    if !meta.force && meta.file_version <= identity.file_version {
        return Err(OtaError::VersionMismatch {
            current: identity.file_version,
            latest: meta.file_version,
        });
    }
    Ok(())
}

/// Download `meta.url`, check its checksum and parse it.
pub(crate) async fn download_and_parse(
    fetcher: &dyn Fetcher,
    meta: &ImageMeta,
) -> Result<Image, OtaError> {
    let bytes = fetcher.get(&meta.url).await?;
    tracing::debug!(url = %meta.url, size = bytes.len(), "Downloaded image");

    if let Some(expected) = &meta.sha512 {
        let actual = hex::encode(Sha512::digest(&bytes));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(OtaError::validation("sha512", expected, actual));
        }
        tracing::debug!("File checksum validation succeeded");
    } else if let Some(expected) = &meta.sha256 {
        let actual = hex::encode(Sha256::digest(&bytes));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(OtaError::validation("sha256", expected, actual));
        }
        tracing::debug!("File checksum validation succeeded");
    }

    // Vendor containers may precede the OTA header.
    let start = find_image_start(&bytes).unwrap_or(0);
    Ok(Image::parse(&bytes[start..])?)
}

/// Check a downloaded image against its metadata and the requesting device.
pub(crate) fn validate_image(
    image: &Image,
    meta: &ImageMeta,
    identity: &DeviceFirmwareIdentity,
) -> Result<(), OtaError> {
    let header = image.header();
    if header.file_version != meta.file_version {
        return Err(OtaError::validation(
            "fileVersion",
            format!("0x{:08X}", meta.file_version),
            format!("0x{:08X}", header.file_version),
        ));
    }
    if let Some(size) = meta.file_size {
        if header.total_image_size != size {
            return Err(OtaError::validation(
                "totalImageSize",
                size,
                header.total_image_size,
            ));
        }
    }
    if header.manufacturer_code != identity.manufacturer_code {
        return Err(OtaError::validation(
            "manufacturerCode",
            format!("0x{:04X}", identity.manufacturer_code),
            format!("0x{:04X}", header.manufacturer_code),
        ));
    }
    if header.image_type != identity.image_type {
        return Err(OtaError::validation(
            "imageType",
            format!("0x{:04X}", identity.image_type),
            format!("0x{:04X}", header.image_type),
        ));
    }
    if let (Some(min), Some(max)) = (header.hardware_version_min, header.hardware_version_max) {
        let range = format!("{min}..={max}");
        match identity.hardware_version {
            Some(hw) if header.hardware_version_in_range(hw) == Some(true) => {}
            Some(hw) => return Err(OtaError::validation("hardwareVersion", range, hw)),
            None => return Err(OtaError::validation("hardwareVersion", range, "not reported")),
        }
    }
    verify_image_data(image)
        .map_err(|e| OtaError::validation("imageData", "intact firmware", e))?;
    Ok(())
}

/// Distribution endpoints, overridable for mirrors and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// JSON catalog of community-hosted images.
    pub catalog_index_url: String,
    /// Base URL of the Ledvance/Osram update API.
    pub vendor_api_url: String,
    /// Ubisys firmware download page.
    pub ubisys_firmware_url: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            catalog_index_url: DEFAULT_CATALOG_INDEX_URL.to_string(),
            vendor_api_url: DEFAULT_VENDOR_API_URL.to_string(),
            ubisys_firmware_url: DEFAULT_UBISYS_FIRMWARE_URL.to_string(),
        }
    }
}

/// Full configuration file: session timings plus backend endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    pub session: SessionConfig,
    pub backends: BackendConfig,
}

impl OtaConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: OtaConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Pick the backend serving devices of `manufacturer_name`.
///
/// Unknown manufacturers get the no-op backend.
pub fn backend_for_manufacturer(
    manufacturer_name: &str,
    fetcher: Arc<dyn Fetcher>,
    config: &BackendConfig,
) -> Box<dyn Backend> {
    let name = manufacturer_name.trim().to_ascii_lowercase();
    let backend: Box<dyn Backend> = if name.starts_with("ledvance") {
        Box::new(IndexBackend::new(
            IndexFormat::Ledvance,
            &config.vendor_api_url,
            fetcher,
        ))
    } else if name.starts_with("osram") {
        Box::new(IndexBackend::new(
            IndexFormat::Osram,
            &config.vendor_api_url,
            fetcher,
        ))
    } else if name.starts_with("ubisys") {
        Box::new(ScrapeBackend::new(
            &config.ubisys_firmware_url,
            UBISYS_MANUFACTURER_CODE,
            fetcher,
        ))
    } else if is_catalog_vendor(&name) {
        Box::new(
            IndexBackend::new(IndexFormat::Catalog, &config.catalog_index_url, fetcher)
                .with_manufacturer_name(manufacturer_name.trim()),
        )
    } else {
        Box::new(NoopBackend)
    };
    tracing::debug!(
        manufacturer = %manufacturer_name,
        backend = backend.name(),
        "Selected firmware backend"
    );
    backend
}

const CATALOG_VENDORS: &[&str] = &[
    "ikea",
    "philips",
    "signify",
    "innr",
    "sengled",
    "salus",
    "lixee",
    "legrand",
    "danfoss",
    "gledopto",
    "jethome",
    "lumi",
    "sonoff",
    "ewelink",
    "tuya",
    "_tz",
    "bosch",
    "schneider",
    "third reality",
];

fn is_catalog_vendor(lowercase_name: &str) -> bool {
    CATALOG_VENDORS
        .iter()
        .any(|vendor| lowercase_name.starts_with(vendor))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::image::{ImageHeader, SubElement};
    use crate::protocol::tags;

    pub fn build_image(manufacturer_code: u16, image_type: u16, file_version: u32) -> Image {
        build_image_with_header(ImageHeader::new(manufacturer_code, image_type, file_version))
    }

    pub fn build_image_with_header(header: ImageHeader) -> Image {
        let payload: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        match Image::assemble(header, vec![SubElement::new(tags::UPGRADE_IMAGE, payload)]) {
            Ok(image) => image,
            Err(e) => panic!("test image: {e}"),
        }
    }

    pub fn sha512_hex(bytes: &[u8]) -> String {
        hex::encode(Sha512::digest(bytes))
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::image::{ImageHeader, SubElement};
    use crate::protocol::tags;

    fn meta_for(image: &Image, url: &str) -> ImageMeta {
        ImageMeta {
            file_version: image.header().file_version,
            file_size: Some(image.header().total_image_size),
            url: url.to_string(),
            sha512: None,
            sha256: None,
            hardware_version_min: None,
            hardware_version_max: None,
            force: false,
        }
    }

    #[tokio::test]
    async fn test_download_skips_vendor_wrapper() {
        let image = build_image(0x10F2, 0x7B09, 0x0200);
        let mut wrapped = b"VENDOR-CONTAINER".to_vec();
        wrapped.extend_from_slice(image.raw());
        let fetcher = StaticFetcher::new().with("https://fw/x.ota", wrapped);

        let parsed = download_and_parse(&fetcher, &meta_for(&image, "https://fw/x.ota"))
            .await
            .unwrap();
        assert_eq!(parsed.raw(), image.raw());
    }

    #[tokio::test]
    async fn test_checksum_mismatch() {
        let image = build_image(0x10F2, 0x7B09, 0x0200);
        let fetcher = StaticFetcher::new().with("https://fw/x.ota", image.raw().to_vec());
        let mut meta = meta_for(&image, "https://fw/x.ota");
        meta.sha512 = Some(sha512_hex(b"something else"));

        let err = download_and_parse(&fetcher, &meta).await.unwrap_err();
        assert!(matches!(err, OtaError::ValidationFailed { field: "sha512", .. }));

        meta.sha512 = Some(sha512_hex(image.raw()).to_uppercase());
        assert!(download_and_parse(&fetcher, &meta).await.is_ok());
    }

    #[tokio::test]
    async fn test_sha256_fallback() {
        let image = build_image(0x10F2, 0x7B09, 0x0200);
        let fetcher = StaticFetcher::new().with("https://fw/x.ota", image.raw().to_vec());
        let mut meta = meta_for(&image, "https://fw/x.ota");
        meta.sha256 = Some(sha256_hex(b"something else"));

        let err = download_and_parse(&fetcher, &meta).await.unwrap_err();
        assert!(matches!(err, OtaError::ValidationFailed { field: "sha256", .. }));

        meta.sha256 = Some(sha256_hex(image.raw()));
        assert!(download_and_parse(&fetcher, &meta).await.is_ok());

        // SHA-512 takes precedence when both are published.
        meta.sha256 = Some(sha256_hex(b"something else"));
        meta.sha512 = Some(sha512_hex(image.raw()));
        assert!(download_and_parse(&fetcher, &meta).await.is_ok());
    }

    #[test]
    fn test_force_overrides_version_order() {
        let image = build_image(0x1037, 0x0001, 5);
        let mut meta = meta_for(&image, "https://fw/x.ota");
        let identity = DeviceFirmwareIdentity::new(0x1037, 0x0001, 7);

        assert_eq!(compare_versions(&identity, &meta), Ordering::Greater);
        assert!(matches!(
            ensure_newer(&identity, &meta),
            Err(OtaError::VersionMismatch { current: 7, latest: 5 })
        ));

        meta.force = true;
        assert_eq!(compare_versions(&identity, &meta), Ordering::Less);
        assert!(ensure_newer(&identity, &meta).is_ok());
    }

    #[test]
    fn test_validate_hardware_range() {
        let header = ImageHeader::new(0x1037, 0x0001, 5).with_hardware_versions(2, 4);
        let image = build_image_with_header(header);
        let meta = meta_for(&image, "https://fw/x.ota");

        let mut identity = DeviceFirmwareIdentity::new(0x1037, 0x0001, 1);
        identity.hardware_version = Some(3);
        assert!(validate_image(&image, &meta, &identity).is_ok());

        identity.hardware_version = Some(5);
        let err = validate_image(&image, &meta, &identity).unwrap_err();
        assert!(matches!(
            err,
            OtaError::ValidationFailed {
                field: "hardwareVersion",
                ..
            }
        ));

        identity.hardware_version = None;
        let err = validate_image(&image, &meta, &identity).unwrap_err();
        assert!(err.to_string().contains("not reported"), "{err}");
    }

    #[test]
    fn test_validate_corrupted_firmware() {
        // EBL header tag, then an end tag whose CRC is zero.
        let payload = vec![
            0x00, 0x00, 0x00, 0x04, 0x01, 0x00, 0xE3, 0x50, 0xFC, 0x04, 0x00, 0x04, 0, 0, 0, 0,
        ];
        let image = Image::assemble(
            ImageHeader::new(0x1037, 0x0001, 5),
            vec![SubElement::new(tags::UPGRADE_IMAGE, payload)],
        )
        .unwrap();
        let meta = meta_for(&image, "https://fw/x.ota");
        let identity = DeviceFirmwareIdentity::new(0x1037, 0x0001, 1);

        let err = validate_image(&image, &meta, &identity).unwrap_err();
        assert!(matches!(err, OtaError::ValidationFailed { field: "imageData", .. }));
    }

    #[test]
    fn test_validate_manufacturer_mismatch() {
        let image = build_image(0x1234, 0x0001, 5);
        let meta = meta_for(&image, "https://fw/x.ota");
        let identity = DeviceFirmwareIdentity::new(0x1037, 0x0001, 1);

        let err = validate_image(&image, &meta, &identity).unwrap_err();
        assert!(matches!(
            err,
            OtaError::ValidationFailed {
                field: "manufacturerCode",
                ..
            }
        ));
    }

    #[test]
    fn test_validate_size_mismatch() {
        let image = build_image(0x1037, 0x0001, 5);
        let mut meta = meta_for(&image, "https://fw/x.ota");
        meta.file_size = Some(1);
        let identity = DeviceFirmwareIdentity::new(0x1037, 0x0001, 1);
        assert!(matches!(
            validate_image(&image, &meta, &identity),
            Err(OtaError::ValidationFailed {
                field: "totalImageSize",
                ..
            })
        ));
    }

    #[test]
    fn test_backend_selection() {
        let fetcher: Arc<dyn Fetcher> = Arc::new(StaticFetcher::new());
        let config = BackendConfig::default();
        let pick = |name: &str| backend_for_manufacturer(name, fetcher.clone(), &config).name();

        assert_eq!(pick("LEDVANCE"), "ledvance");
        assert_eq!(pick("OSRAM"), "osram");
        assert_eq!(pick("ubisys"), "ubisys");
        assert_eq!(pick("IKEA of Sweden"), "catalog");
        assert_eq!(pick("Acme Widgets"), "noop");
    }

    #[test]
    fn test_config_defaults_from_partial_toml() {
        let config: OtaConfig = toml::from_str(
            r#"
            [backends]
            ubisys_firmware_url = "http://mirror.local/ubisys/"
            "#,
        )
        .unwrap();
        assert_eq!(config.backends.ubisys_firmware_url, "http://mirror.local/ubisys/");
        assert_eq!(config.backends.catalog_index_url, DEFAULT_CATALOG_INDEX_URL);
        assert_eq!(config.session, SessionConfig::default());
    }
}
