//! Check whether a device has an update without transferring anything.

use std::cmp::Ordering;

use tracing::{debug, info, instrument, warn};

use crate::backend::Backend;
use crate::error::OtaError;
use crate::identity::DeviceFirmwareIdentity;
use crate::session::{SessionConfig, reply_no_image, request_identity};
use crate::transport::OtaDevice;
use crate::waiter::CancelGroup;

/// Ask `backend` whether something newer than the device's firmware exists.
///
/// Without an `identity`, the device is asked for it with `imageNotify`;
/// that query is then answered with "no image available" so the device
/// does not start a transfer.
#[instrument(skip_all, fields(ieee_address = %device.ieee_address(), backend = backend.name()))]
pub async fn check_available(
    device: &dyn OtaDevice,
    backend: &dyn Backend,
    identity: Option<DeviceFirmwareIdentity>,
    config: &SessionConfig,
) -> Result<bool, OtaError> {
    let identity = match identity {
        Some(identity) => identity,
        None => {
            let endpoint = device
                .ota_endpoint()
                .ok_or_else(|| OtaError::NoOtaEndpoint {
                    ieee_address: device.ieee_address().to_string(),
                })?;
            debug!(endpoint = endpoint, "Using endpoint");

            let group = CancelGroup::new();
            let (tsn, request) =
                request_identity(device, endpoint, &group, config.initial_query_timeout()).await?;
            reply_no_image(device, endpoint, tsn).await;
            DeviceFirmwareIdentity::from(&request)
        }
    };
    debug!(identity = %identity, "Checking for newer firmware");

    let ordering = backend.is_newer_available(&identity).await?;
    if ordering == Ordering::Greater {
        warn!(identity = %identity, "Firmware on device is newer than latest firmware online");
    }
    let available = ordering == Ordering::Less;
    info!(available = available, "Update available: {}", if available { "YES" } else { "NO" });
    Ok(available)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::backend::{IndexBackend, IndexFormat, NoopBackend, StaticFetcher};
    use crate::protocol::{InboundKind, OtaStatus, OutboundCommand};
    use crate::transport::{MockDevice, well_behaved_device};

    const INDEX: &str = "https://index/index.json";

    fn backend(latest: u32) -> IndexBackend {
        let index = format!(
            r#"[{{"fileVersion": {}, "url": "https://fw/a.ota", "imageType": 1, "manufacturerCode": 4107}}]"#,
            latest
        );
        IndexBackend::new(
            IndexFormat::Catalog,
            INDEX,
            Arc::new(StaticFetcher::new().with(INDEX, index)),
        )
    }

    fn device(file_version: u32) -> MockDevice {
        MockDevice::with_responder(
            "0x00124b00abcdef01",
            Some(1),
            well_behaved_device(
                DeviceFirmwareIdentity::new(4107, 1, file_version),
                64,
                OtaStatus::SUCCESS,
            ),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_queries_device_when_identity_missing() {
        let device = device(10);
        let available = check_available(&device, &backend(20), None, &SessionConfig::default())
            .await
            .unwrap();

        assert!(available);
        let replies = device.sent_named("queryNextImageResponse");
        assert_eq!(replies.len(), 1);
        match &replies[0].command {
            OutboundCommand::QueryNextImageResponse(r) => {
                assert_eq!(r.status, OtaStatus::NO_IMAGE_AVAILABLE)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(device.armed(), vec![InboundKind::QueryNextImageRequest]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_given_identity_skips_device() {
        let device = MockDevice::new("0x00124b00abcdef01", Some(1));
        let identity = DeviceFirmwareIdentity::new(4107, 1, 20);

        let config = SessionConfig::default();
        let available = check_available(&device, &backend(20), Some(identity), &config)
            .await
            .unwrap();
        assert!(!available);
        assert!(device.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_newer_is_not_available() {
        let identity = DeviceFirmwareIdentity::new(4107, 1, 30);
        let device = MockDevice::new("0x00124b00abcdef01", Some(1));
        assert!(
            !check_available(&device, &backend(20), Some(identity), &SessionConfig::default())
                .await
                .unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out() {
        let device = MockDevice::new("0x00124b00abcdef01", Some(1));
        let err = check_available(&device, &NoopBackend, None, &SessionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OtaError::NoResponse { .. }));
    }
}
