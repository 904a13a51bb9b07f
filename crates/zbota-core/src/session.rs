//! Update session - drives one device through an OTA upgrade.
//!
//! A session runs the handshake `imageNotify -> queryNextImageRequest`,
//! resolves an image through a [`Backend`], serves `imageBlockRequest`s
//! until the device reports the outcome with `upgradeEndRequest`, and
//! answers that. A single driver selects over every outstanding wait.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::Backend;
use crate::error::OtaError;
use crate::events::{LogLevel, OtaEvent, OtaObserver, TracingObserver};
use crate::identity::DeviceFirmwareIdentity;
use crate::image::Image;
use crate::protocol::constants::{
    BLOCK_REQUEST_TIMEOUT_MS, BLOCK_RESPONSE_PACING_MS, DEFAULT_MAXIMUM_DATA_SIZE,
    INITIAL_QUERY_TIMEOUT_MS, INSTA_MANUFACTURER_CODE, INSTA_MAXIMUM_DATA_SIZE,
    LEGRAND_MANUFACTURER_CODE, LONG_POLL_TIMEOUT_MS, PROGRESS_INTERVAL_MS, REBOOT_GRACE_MS,
};
use crate::protocol::{
    DefaultResponse, ImageBlockRequest, ImageBlockResponse, ImageNotify, InboundCommand,
    InboundFrame, InboundKind, OtaStatus, OutboundCommand, QueryNextImageRequest,
    QueryNextImageResponse, UpgradeEndResponse,
};
use crate::state::{BlockPacer, ProgressTracker, SessionState};
use crate::transport::{OtaDevice, TransportError};
use crate::waiter::{CancelGroup, WaitError};

/// Timing configuration for update sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Wait for the first `queryNextImageRequest` after `imageNotify`.
    pub initial_query_timeout_ms: u64,
    /// Wait for each `imageBlockRequest`.
    pub block_request_timeout_ms: u64,
    /// Wait for re-queries and for `upgradeEndRequest`.
    pub long_poll_timeout_ms: u64,
    /// Minimum spacing between block responses.
    pub block_response_pacing_ms: u64,
    /// Minimum spacing between progress reports.
    pub progress_interval_ms: u64,
    /// Time given to the device to restart after a successful upgrade.
    pub reboot_grace_ms: u64,
    /// Upper bound on block sizes, for devices that request more than
    /// they can handle. Some manufacturers get their own limit.
    pub max_block_size: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_query_timeout_ms: INITIAL_QUERY_TIMEOUT_MS,
            block_request_timeout_ms: BLOCK_REQUEST_TIMEOUT_MS,
            long_poll_timeout_ms: LONG_POLL_TIMEOUT_MS,
            block_response_pacing_ms: BLOCK_RESPONSE_PACING_MS,
            progress_interval_ms: PROGRESS_INTERVAL_MS,
            reboot_grace_ms: REBOOT_GRACE_MS,
            max_block_size: DEFAULT_MAXIMUM_DATA_SIZE,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn initial_query_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_query_timeout_ms)
    }

    pub fn block_request_timeout(&self) -> Duration {
        Duration::from_millis(self.block_request_timeout_ms)
    }

    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.long_poll_timeout_ms)
    }

    pub fn block_response_pacing(&self) -> Duration {
        Duration::from_millis(self.block_response_pacing_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn reboot_grace(&self) -> Duration {
        Duration::from_millis(self.reboot_grace_ms)
    }

    /// Bytes to serve for a request from `manufacturer_code` asking for
    /// `requested`.
    fn block_size(&self, manufacturer_code: u16, requested: u8) -> u8 {
        match manufacturer_code {
            INSTA_MANUFACTURER_CODE => requested.min(INSTA_MAXIMUM_DATA_SIZE),
            LEGRAND_MANUFACTURER_CODE => requested,
            _ => requested.min(self.max_block_size),
        }
    }
}

/// Block responses owed to the device for its latest request.
struct PendingBlocks {
    tsn: Option<u8>,
    request: ImageBlockRequest,
    /// End of the requested page. `None` for a single block request.
    page_end: Option<u32>,
}

impl PendingBlocks {
    fn from_frame(frame: InboundFrame, total: u32) -> Result<Self, OtaError> {
        let tsn = frame.transaction_sequence_number;
        match frame.command {
            InboundCommand::ImageBlockRequest(request) => Ok(Self {
                tsn,
                request,
                page_end: None,
            }),
            InboundCommand::ImagePageRequest(page) => Ok(Self {
                tsn,
                request: page.first_block(),
                page_end: Some(
                    page.file_offset
                        .saturating_add(u32::from(page.page_size))
                        .min(total),
                ),
            }),
            other => Err(TransportError::UnexpectedCommand {
                expected: InboundKind::ImageBlockRequest,
                actual: other.kind(),
            }
            .into()),
        }
    }

    /// The next block to send, trimmed to the page.
    fn next_block(&self) -> ImageBlockRequest {
        let mut block = self.request;
        if let Some(end) = self.page_end {
            let left = end.saturating_sub(block.file_offset);
            let left = u8::try_from(left).unwrap_or(u8::MAX);
            block.maximum_data_size = block.maximum_data_size.min(left);
        }
        block
    }

    /// Move past a sent block. Returns false once the request is served.
    fn advance(&mut self, sent: u8) -> bool {
        let Some(end) = self.page_end else {
            return false;
        };
        self.request.file_offset = self.request.file_offset.saturating_add(u32::from(sent));
        sent > 0 && self.request.file_offset < end
    }
}

/// Update session - owns the state of one update attempt at a time.
pub struct UpdateSession<O: OtaObserver> {
    config: SessionConfig,
    observer: Arc<O>,
    cancel: CancellationToken,
    state: SessionState,
}

impl UpdateSession<TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: OtaObserver> UpdateSession<O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: SessionConfig, observer: Arc<O>) -> Self {
        Self {
            config,
            observer,
            cancel: CancellationToken::new(),
            state: SessionState::NotStarted,
        }
    }

    /// Token that aborts the running update with [`OtaError::Canceled`].
    ///
    /// Once canceled, the session stays canceled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn goto(&mut self, to: SessionState) {
        if self.state == to {
            return;
        }
        let from = std::mem::replace(&mut self.state, to.clone());
        info!(from = %from, to = %to, "State transition");
        self.observer.on_event(&OtaEvent::PhaseChanged { from, to });
    }

    /// Upgrade `device` to the newest image `backend` offers.
    ///
    /// Returns the file version the device accepted.
    #[instrument(skip_all, fields(ieee_address = %device.ieee_address(), backend = backend.name()))]
    pub async fn perform_update(
        &mut self,
        device: &dyn OtaDevice,
        backend: &dyn Backend,
    ) -> Result<u32, OtaError> {
        self.state = SessionState::NotStarted;
        let result = self.drive(device, backend).await;

        match &result {
            Ok(file_version) => {
                info!(file_version = %format!("0x{:08X}", file_version), "Update successful");
                self.goto(SessionState::Succeeded);
                self.observer.on_event(&OtaEvent::Complete);
            }
            Err(e) => {
                let terminal = match e {
                    OtaError::DeviceRejected { reason, .. } => SessionState::Failed(reason.clone()),
                    OtaError::Canceled => SessionState::Canceled,
                    e if e.is_timeout() => SessionState::TimedOut,
                    e => SessionState::Failed(e.to_string()),
                };
                warn!(error = %e, "Update failed");
                self.goto(terminal);
                self.observer.on_event(&OtaEvent::Error {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn drive(
        &mut self,
        device: &dyn OtaDevice,
        backend: &dyn Backend,
    ) -> Result<u32, OtaError> {
        let endpoint = device
            .ota_endpoint()
            .ok_or_else(|| OtaError::NoOtaEndpoint {
                ieee_address: device.ieee_address().to_string(),
            })?;
        debug!(endpoint = endpoint, "Using endpoint");

        let group = CancelGroup::child_of(&self.cancel);

        self.goto(SessionState::AwaitingInitialQuery);
        let (tsn, request) =
            request_identity(device, endpoint, &group, self.config.initial_query_timeout()).await?;
        let identity = DeviceFirmwareIdentity::from(&request);
        info!(identity = %identity, "Got queryNextImageRequest");

        let image = tokio::select! {
            biased;
            _ = group.cancelled() => return Err(OtaError::Canceled),
            result = backend.fetch_image(&identity) => match result {
                Ok(image) => image,
                Err(e) => {
                    reply_no_image(device, endpoint, tsn).await;
                    return Err(e);
                }
            },
        };
        let header = image.header();
        self.observer.on_event(&OtaEvent::ImageResolved {
            file_version: header.file_version,
            size: header.total_image_size,
        });

        self.transfer(device, endpoint, &group, &image, tsn).await
    }

    async fn transfer(
        &mut self,
        device: &dyn OtaDevice,
        endpoint: u8,
        group: &CancelGroup,
        image: &Image,
        query_tsn: Option<u8>,
    ) -> Result<u32, OtaError> {
        let long_poll = self.config.long_poll_timeout();
        let block_timeout = self.config.block_request_timeout();
        let total = image.header().total_image_size;
        let arm = |kind: InboundKind, timeout: Duration| {
            group.await_command(device, endpoint, kind, timeout)
        };
        // Devices ask for data block by block or a page at a time.
        let next_request = || {
            let block = arm(InboundKind::ImageBlockRequest, block_timeout);
            let page = arm(InboundKind::ImagePageRequest, block_timeout);
            async move {
                tokio::select! {
                    biased;
                    result = block => result,
                    result = page => result,
                }
            }
            .boxed()
        };

        // Armed before the query is answered so the first data request
        // cannot slip past.
        let mut query = arm(InboundKind::QueryNextImageRequest, long_poll);
        let mut request = next_request();
        let mut end = arm(InboundKind::UpgradeEndRequest, long_poll);

        send_query_response(device, endpoint, image, query_tsn).await;
        self.goto(SessionState::TransferringBlocks);
        info!(size = total, "Starting transfer");

        let mut pending: Option<PendingBlocks> = None;
        let mut pacer = BlockPacer::new(self.config.block_response_pacing());
        let mut progress =
            ProgressTracker::new(total, self.config.progress_interval(), Instant::now());
        let mut last_offset = 0u32;
        let pace = tokio::time::sleep_until(Instant::now());
        tokio::pin!(pace);

        loop {
            tokio::select! {
                biased;

                _ = group.cancelled() => return Err(OtaError::Canceled),

                result = &mut end => {
                    let frame = result?;
                    group.cancel();
                    return self.finish(device, endpoint, image, frame).await;
                }

                result = &mut query => {
                    let frame = result?;
                    debug!("Device queried again during transfer");
                    let tsn = frame.transaction_sequence_number;
                    send_query_response(device, endpoint, image, tsn).await;
                    query = arm(InboundKind::QueryNextImageRequest, long_poll);
                }

                result = &mut request, if pending.is_none() => {
                    let frame = result.map_err(|e| match e {
                        WaitError::Timeout { timeout, .. } => OtaError::Stalled {
                            offset: last_offset,
                            timeout,
                        },
                        e => e.into(),
                    })?;
                    let blocks = PendingBlocks::from_frame(frame, total)?;
                    if let Some(page_end) = blocks.page_end {
                        let offset = blocks.request.file_offset;
                        debug!(offset, page_end, "Got imagePageRequest");
                    }
                    pending = Some(blocks);
                    pace.as_mut().reset(pacer.next_slot(Instant::now()));
                }

                () = &mut pace, if pending.is_some() => {
                    let Some(mut blocks) = pending.take() else {
                        continue;
                    };
                    let block = blocks.next_block();
                    pacer.mark(Instant::now());
                    let sent = self.serve_block(device, endpoint, image, &block, blocks.tsn).await;
                    if sent.is_some() {
                        last_offset = block.file_offset;
                    }

                    if let Some(report) = progress.record(block.file_offset, Instant::now()) {
                        self.observer.on_event(&OtaEvent::Progress {
                            percentage: report.percentage,
                            remaining_seconds: report.remaining_seconds,
                        });
                    }

                    // A failed send abandons the rest of a page.
                    match sent {
                        Some(size) if blocks.advance(size) => {
                            pending = Some(blocks);
                            pace.as_mut().reset(pacer.next_slot(Instant::now()));
                        }
                        _ => request = next_request(),
                    }
                }
            }
        }
    }

    /// Answer one block request. Returns the number of bytes sent, or
    /// `None` when the response did not go out.
    async fn serve_block(
        &mut self,
        device: &dyn OtaDevice,
        endpoint: u8,
        image: &Image,
        request: &ImageBlockRequest,
        tsn: Option<u8>,
    ) -> Option<u8> {
        let size = self
            .config
            .block_size(request.manufacturer_code, request.maximum_data_size);
        let data = image.block(request.file_offset, usize::from(size)).to_vec();
        let data_size = data.len() as u8;
        let response = ImageBlockResponse {
            status: OtaStatus::SUCCESS,
            manufacturer_code: request.manufacturer_code,
            image_type: request.image_type,
            file_version: request.file_version,
            file_offset: request.file_offset,
            data_size,
            data,
        };

        match device
            .send_command(endpoint, OutboundCommand::ImageBlockResponse(response), tsn)
            .await
        {
            Ok(()) => {
                self.observer.on_event(&OtaEvent::BlockSent {
                    offset: request.file_offset,
                    size: data_size,
                });
                let served = request.file_offset.saturating_add(u32::from(data_size));
                if served >= image.header().total_image_size {
                    self.goto(SessionState::AwaitingCompletion);
                }
                Some(data_size)
            }
            Err(e) => {
                // The device requests the block again.
                debug!(offset = request.file_offset, error = %e, "Image block response failed");
                self.observer.on_event(&OtaEvent::Log {
                    level: LogLevel::Warn,
                    message: format!(
                        "Image block response at offset {} failed: {}",
                        request.file_offset, e
                    ),
                });
                None
            }
        }
    }

    async fn finish(
        &mut self,
        device: &dyn OtaDevice,
        endpoint: u8,
        image: &Image,
        frame: InboundFrame,
    ) -> Result<u32, OtaError> {
        let InboundCommand::UpgradeEndRequest(request) = frame.command else {
            return Err(TransportError::UnexpectedCommand {
                expected: InboundKind::UpgradeEndRequest,
                actual: frame.command.kind(),
            }
            .into());
        };
        debug!(status = ?request.status, "Got upgradeEndRequest");

        if !request.status.is_success() {
            // Acknowledge the report so the device does not retry it.
            let ack = OutboundCommand::DefaultResponse(DefaultResponse::upgrade_end_acknowledged());
            if let Err(e) = device
                .send_command(endpoint, ack, frame.transaction_sequence_number)
                .await
            {
                warn!(error = %e, "Failed to send default response");
                self.observer.on_event(&OtaEvent::Log {
                    level: LogLevel::Warn,
                    message: format!("Default response to upgradeEndRequest failed: {}", e),
                });
            }
            return Err(OtaError::DeviceRejected {
                status: request.status.value(),
                reason: request.status.to_string(),
            });
        }

        device
            .send_command(
                endpoint,
                OutboundCommand::UpgradeEndResponse(UpgradeEndResponse::upgrade_now(image)),
                frame.transaction_sequence_number,
            )
            .await?;
        info!("Update successful, waiting for device to restart");

        tokio::time::sleep(self.config.reboot_grace()).await;
        self.observer.on_event(&OtaEvent::Progress {
            percentage: 100.0,
            remaining_seconds: None,
        });
        Ok(image.header().file_version)
    }
}

/// Run one update session with default timings.
pub async fn perform_update<O: OtaObserver>(
    device: &dyn OtaDevice,
    backend: &dyn Backend,
    observer: Arc<O>,
) -> Result<u32, OtaError> {
    UpdateSession::with_observer(SessionConfig::default(), observer)
        .perform_update(device, backend)
        .await
}

/// Send `imageNotify` and wait for the device's `queryNextImageRequest`.
///
/// Returns the request with its transaction sequence number.
pub(crate) async fn request_identity(
    device: &dyn OtaDevice,
    endpoint: u8,
    group: &CancelGroup,
    timeout: Duration,
) -> Result<(Option<u8>, QueryNextImageRequest), OtaError> {
    let waiter =
        group.await_command(device, endpoint, InboundKind::QueryNextImageRequest, timeout);
    device
        .send_command(endpoint, OutboundCommand::ImageNotify(ImageNotify::default()), None)
        .await?;

    let frame = waiter.await?;
    match frame.command {
        InboundCommand::QueryNextImageRequest(request) => {
            Ok((frame.transaction_sequence_number, request))
        }
        other => Err(TransportError::UnexpectedCommand {
            expected: InboundKind::QueryNextImageRequest,
            actual: other.kind(),
        }
        .into()),
    }
}

/// Tell a querying device there is nothing for it. Best-effort.
pub(crate) async fn reply_no_image(device: &dyn OtaDevice, endpoint: u8, tsn: Option<u8>) {
    let response =
        OutboundCommand::QueryNextImageResponse(QueryNextImageResponse::no_image_available());
    if let Err(e) = device.send_command(endpoint, response, tsn).await {
        warn!(error = %e, "Failed to send queryNextImageResponse (no image available)");
    }
}

async fn send_query_response(
    device: &dyn OtaDevice,
    endpoint: u8,
    image: &Image,
    tsn: Option<u8>,
) {
    let response =
        OutboundCommand::QueryNextImageResponse(QueryNextImageResponse::for_image(image));
    if let Err(e) = device.send_command(endpoint, response, tsn).await {
        warn!(error = %e, "Failed to send queryNextImageResponse");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::backend::test_support::build_image;
    use crate::backend::{IndexBackend, IndexFormat, NoopBackend, StaticFetcher};
    use crate::transport::{
        MockDevice, Responder, SentCommand, paging_device, well_behaved_device,
    };

    const MFR: u16 = 0x1037;
    const IMAGE_TYPE: u16 = 0x0001;

    struct FixedBackend(Image);

    #[async_trait]
    impl Backend for FixedBackend {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn is_newer_available(
            &self,
            identity: &DeviceFirmwareIdentity,
        ) -> Result<Ordering, OtaError> {
            Ok(identity.file_version.cmp(&self.0.header().file_version))
        }

        async fn fetch_image(&self, _identity: &DeviceFirmwareIdentity) -> Result<Image, OtaError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<OtaEvent>>);

    impl OtaObserver for Recorder {
        fn on_event(&self, event: &OtaEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    impl Recorder {
        fn logs(&self) -> Vec<(LogLevel, String)> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    OtaEvent::Log { level, message } => Some((*level, message.clone())),
                    _ => None,
                })
                .collect()
        }

        fn progress(&self) -> Vec<(f64, Option<u64>)> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    OtaEvent::Progress {
                        percentage,
                        remaining_seconds,
                    } => Some((*percentage, *remaining_seconds)),
                    _ => None,
                })
                .collect()
        }
    }

    fn device(block_size: u8, end_status: OtaStatus) -> MockDevice {
        let identity = DeviceFirmwareIdentity::new(MFR, IMAGE_TYPE, 1);
        MockDevice::with_responder(
            "0x00124b0012345678",
            Some(1),
            well_behaved_device(identity, block_size, end_status),
        )
    }

    fn session(config: SessionConfig) -> (UpdateSession<Recorder>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (UpdateSession::with_observer(config, recorder.clone()), recorder)
    }

    fn block_responses(device: &MockDevice) -> Vec<(SentCommand, ImageBlockResponse)> {
        device
            .sent()
            .into_iter()
            .filter_map(|s| match &s.command {
                OutboundCommand::ImageBlockResponse(r) => {
                    let r = r.clone();
                    Some((s, r))
                }
                _ => None,
            })
            .collect()
    }

    fn served_bytes(device: &MockDevice) -> Vec<u8> {
        block_responses(device)
            .into_iter()
            .flat_map(|(_, r)| r.data)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_update() {
        let image = build_image(MFR, IMAGE_TYPE, 2);
        let device = device(64, OtaStatus::SUCCESS);
        let (mut session, recorder) = session(SessionConfig::default());

        let start = Instant::now();
        let version = session
            .perform_update(&device, &FixedBackend(image.clone()))
            .await
            .unwrap();

        assert_eq!(version, 2);
        assert_eq!(session.state(), &SessionState::Succeeded);
        assert_eq!(served_bytes(&device), image.raw());
        assert!(start.elapsed() >= Duration::from_secs(30));

        let ends = device.sent_named("upgradeEndResponse");
        assert_eq!(ends.len(), 1);
        match &ends[0].command {
            OutboundCommand::UpgradeEndResponse(r) => {
                assert_eq!(r.current_time, 0);
                assert_eq!(r.upgrade_time, 1);
                assert_eq!(r.file_version, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(recorder.progress().last(), Some(&(100.0, None)));
        assert!(recorder.0.lock().unwrap().contains(&OtaEvent::Complete));
    }

    #[tokio::test(start_paused = true)]
    async fn test_responses_echo_transaction_sequence_number() {
        let image = build_image(MFR, IMAGE_TYPE, 2);
        let device = device(64, OtaStatus::SUCCESS);
        let (mut session, _) = session(SessionConfig::default());
        session
            .perform_update(&device, &FixedBackend(image))
            .await
            .unwrap();

        let queries = device.sent_named("queryNextImageResponse");
        assert_eq!(queries[0].transaction_sequence_number, Some(0));
        let blocks = block_responses(&device);
        assert_eq!(blocks[0].0.transaction_sequence_number, Some(1));
        assert_eq!(blocks[1].0.transaction_sequence_number, Some(2));
        assert_eq!(device.sent_named("imageNotify")[0].transaction_sequence_number, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_responses_are_paced() {
        let image = build_image(MFR, IMAGE_TYPE, 2);
        let device = device(2, OtaStatus::SUCCESS);
        let (mut session, recorder) = session(SessionConfig::default());
        session
            .perform_update(&device, &FixedBackend(image.clone()))
            .await
            .unwrap();

        let blocks = block_responses(&device);
        assert_eq!(blocks.len(), image.raw().len() / 2);
        for pair in blocks.windows(2) {
            assert!(pair[1].0.at.duration_since(pair[0].0.at) >= Duration::from_millis(250));
        }

        // 181 blocks at 250 ms: one report at the 30 s mark, then the final one.
        let progress = recorder.progress();
        assert_eq!(progress.len(), 2);
        assert!(progress[0].0 > 0.0 && progress[0].0 < 100.0);
        assert!(progress[0].1.is_some());
        assert_eq!(progress[1], (100.0, None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_query_times_out() {
        let device = MockDevice::new("0x00124b0012345678", Some(1));
        let (mut session, _) = session(SessionConfig::default());

        let start = Instant::now();
        let err = session
            .perform_update(&device, &FixedBackend(build_image(MFR, IMAGE_TYPE, 2)))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OtaError::NoResponse {
                command: InboundKind::QueryNextImageRequest,
                ..
            }
        ));
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(session.state(), &SessionState::TimedOut);
        assert_eq!(device.armed(), vec![InboundKind::QueryNextImageRequest]);
        assert_eq!(device.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_reports_invalid_image() {
        let image = build_image(MFR, IMAGE_TYPE, 2);
        let device = device(64, OtaStatus::INVALID_IMAGE);
        let (mut session, _) = session(SessionConfig::default());

        let err = session
            .perform_update(&device, &FixedBackend(image.clone()))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("invalid image"));
        assert_eq!(session.state(), &SessionState::Failed("invalid image".to_string()));
        assert!(device.sent_named("upgradeEndResponse").is_empty());
        assert_eq!(served_bytes(&device), image.raw());

        // The failure report is acknowledged with a default response.
        let last = device.sent().pop().unwrap();
        let end_tsn = u8::try_from(block_responses(&device).len()).unwrap() + 1;
        assert_eq!(last.transaction_sequence_number, Some(end_tsn));
        match &last.command {
            OutboundCommand::DefaultResponse(r) => {
                assert_eq!(r.cluster_id, crate::protocol::OTA_CLUSTER_ID);
                assert_eq!(r.command_id, crate::protocol::UPGRADE_END_REQUEST_ID);
                assert_eq!(r.status, OtaStatus::SUCCESS);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_manufacturer_mismatch_aborts_before_transfer() {
        let wrong = build_image(0x1234, IMAGE_TYPE, 2);
        let index = format!(
            r#"[{{"fileVersion": 2, "url": "https://fw/a.ota", "imageType": {}, "manufacturerCode": {}}}]"#,
            IMAGE_TYPE, MFR
        );
        let fetcher = StaticFetcher::new()
            .with("https://index/index.json", index)
            .with("https://fw/a.ota", wrong.raw().to_vec());
        let backend = IndexBackend::new(
            IndexFormat::Catalog,
            "https://index/index.json",
            Arc::new(fetcher),
        );
        let device = device(64, OtaStatus::SUCCESS);
        let (mut session, _) = session(SessionConfig::default());

        let err = session.perform_update(&device, &backend).await.unwrap_err();

        assert!(matches!(
            err,
            OtaError::ValidationFailed {
                field: "manufacturerCode",
                ..
            }
        ));
        assert!(block_responses(&device).is_empty());
        assert_eq!(device.armed(), vec![InboundKind::QueryNextImageRequest]);

        let replies = device.sent_named("queryNextImageResponse");
        assert_eq!(replies.len(), 1);
        match &replies[0].command {
            OutboundCommand::QueryNextImageResponse(r) => {
                assert_eq!(r.status, OtaStatus::NO_IMAGE_AVAILABLE)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_candidate_replies_no_image() {
        let device = device(64, OtaStatus::SUCCESS);
        let (mut session, _) = session(SessionConfig::default());

        let err = session.perform_update(&device, &NoopBackend).await.unwrap_err();
        assert!(matches!(err, OtaError::NoCandidate(_)));
        assert_eq!(
            device.sent_named("queryNextImageResponse")[0].transaction_sequence_number,
            Some(0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_block_send_is_tolerated() {
        let image = build_image(MFR, IMAGE_TYPE, 2);
        let device = device(64, OtaStatus::SUCCESS);
        device.fail_block_responses(2);
        let (mut session, recorder) = session(SessionConfig::default());

        session
            .perform_update(&device, &FixedBackend(image.clone()))
            .await
            .unwrap();

        assert_eq!(device.failed_sends(), 2);
        assert_eq!(served_bytes(&device), image.raw());
        assert_eq!(session.state(), &SessionState::Succeeded);

        let logs = recorder.logs();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|(level, _)| *level == LogLevel::Warn));
        assert!(logs[0].1.contains("offset 0"), "{}", logs[0].1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_during_transfer_is_answered() {
        let image = build_image(MFR, IMAGE_TYPE, 2);
        let identity = DeviceFirmwareIdentity::new(MFR, IMAGE_TYPE, 1);
        let inner = well_behaved_device(identity, 64, OtaStatus::SUCCESS);
        let responder: Responder = Box::new(move |command: &OutboundCommand| {
            let mut frames = inner(command);
            if let OutboundCommand::ImageBlockResponse(r) = command {
                if r.file_offset == 100 {
                    let query = QueryNextImageRequest {
                        field_control: 0,
                        manufacturer_code: MFR,
                        image_type: IMAGE_TYPE,
                        file_version: 1,
                        hardware_version: None,
                    };
                    frames.push(InboundFrame::with_tsn(
                        InboundCommand::QueryNextImageRequest(query),
                        200,
                    ));
                }
            }
            frames
        });
        let device = MockDevice::with_responder("0x00124b0012345678", Some(1), responder);
        let (mut session, _) = session(SessionConfig::default());

        let version = session
            .perform_update(&device, &FixedBackend(image.clone()))
            .await
            .unwrap();

        assert_eq!(version, 2);
        let queries = device.sent_named("queryNextImageResponse");
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].transaction_sequence_number, Some(0));
        assert_eq!(queries[1].transaction_sequence_number, Some(200));
        match &queries[1].command {
            OutboundCommand::QueryNextImageResponse(r) => {
                assert_eq!(r.status, OtaStatus::SUCCESS);
                assert_eq!(r.file_version, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(served_bytes(&device), image.raw());
        assert_eq!(device.sent_named("upgradeEndResponse").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_requests() {
        let image = build_image(MFR, IMAGE_TYPE, 2);
        let identity = DeviceFirmwareIdentity::new(MFR, IMAGE_TYPE, 1);
        let device = MockDevice::with_responder(
            "0x00124b0012345678",
            Some(1),
            paging_device(identity, 128, 64, OtaStatus::SUCCESS),
        );
        let (mut session, _) = session(SessionConfig::default());

        let version = session
            .perform_update(&device, &FixedBackend(image.clone()))
            .await
            .unwrap();

        assert_eq!(version, 2);
        assert_eq!(served_bytes(&device), image.raw());

        let blocks = block_responses(&device);
        // Pages of 128 bytes served in blocks of at most 50.
        let sizes: Vec<u8> = blocks.iter().map(|(_, r)| r.data_size).collect();
        assert_eq!(&sizes[..3], &[50, 50, 28]);
        for (_, r) in &blocks {
            let page_end = (r.file_offset / 128 + 1) * 128;
            assert!(r.file_offset + u32::from(r.data_size) <= page_end);
        }
        // Every block of a page echoes the page request's sequence number.
        assert!(blocks[..3].iter().all(|(s, _)| s.transaction_sequence_number == Some(1)));
        assert_eq!(blocks[3].0.transaction_sequence_number, Some(2));
        for pair in blocks.windows(2) {
            assert!(pair[1].0.at.duration_since(pair[0].0.at) >= Duration::from_millis(250));
        }
        assert!(device.armed().contains(&InboundKind::ImagePageRequest));
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_size_cap() {
        let image = build_image(MFR, IMAGE_TYPE, 2);
        let device = device(64, OtaStatus::SUCCESS);
        let config = SessionConfig {
            max_block_size: 40,
            ..Default::default()
        };
        let (mut session, _) = session(config);

        session
            .perform_update(&device, &FixedBackend(image.clone()))
            .await
            .unwrap();

        let blocks = block_responses(&device);
        assert!(blocks.iter().all(|(_, r)| r.data_size <= 40));
        assert_eq!(served_bytes(&device), image.raw());
    }

    fn query_only_device() -> MockDevice {
        let identity = DeviceFirmwareIdentity::new(MFR, IMAGE_TYPE, 1);
        let notify_only = well_behaved_device(identity, 64, OtaStatus::SUCCESS);
        let responder: Responder = Box::new(move |command: &OutboundCommand| match command {
            OutboundCommand::ImageNotify(_) => notify_only(command),
            _ => Vec::new(),
        });
        MockDevice::with_responder("0x00124b0012345678", Some(1), responder)
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfer_stalls_without_block_requests() {
        let device = query_only_device();
        let (mut session, _) = session(SessionConfig::default());

        let err = session
            .perform_update(&device, &FixedBackend(build_image(MFR, IMAGE_TYPE, 2)))
            .await
            .unwrap_err();

        assert!(matches!(err, OtaError::Stalled { offset: 0, .. }));
        assert_eq!(session.state(), &SessionState::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancel() {
        let device = query_only_device();
        let (mut session, recorder) = session(SessionConfig::default());
        let token = session.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            token.cancel();
        });

        let start = Instant::now();
        let err = session
            .perform_update(&device, &FixedBackend(build_image(MFR, IMAGE_TYPE, 2)))
            .await
            .unwrap_err();

        assert!(matches!(err, OtaError::Canceled));
        assert!(start.elapsed() < Duration::from_secs(60));
        assert_eq!(session.state(), &SessionState::Canceled);
        assert!(recorder.progress().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_endpoint() {
        let device = MockDevice::new("0x00124b0012345678", None);
        let (mut session, _) = session(SessionConfig::default());

        let err = session
            .perform_update(&device, &NoopBackend)
            .await
            .unwrap_err();
        assert!(matches!(err, OtaError::NoOtaEndpoint { .. }));
        assert!(err.to_string().contains("0x00124b0012345678"));
        assert!(device.sent().is_empty());
    }

    #[test]
    fn test_manufacturer_block_size_limits() {
        let config = SessionConfig::default();
        assert_eq!(config.block_size(MFR, 64), 50);
        assert_eq!(config.block_size(MFR, 32), 32);
        assert_eq!(config.block_size(0x117A, 64), 40);
        assert_eq!(config.block_size(0x117A, 20), 20);
        assert_eq!(config.block_size(0x1021, 200), 200);

        let raised = SessionConfig {
            max_block_size: 64,
            ..Default::default()
        };
        assert_eq!(raised.block_size(MFR, 100), 64);
        assert_eq!(raised.block_size(0x117A, 100), 40);
    }

    #[test]
    fn test_config_roundtrip() {
        let config = SessionConfig {
            max_block_size: 80,
            ..Default::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: SessionConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);

        let partial: SessionConfig = toml::from_str("block_response_pacing_ms = 500").unwrap();
        assert_eq!(partial.block_response_pacing(), Duration::from_millis(500));
        assert_eq!(partial.initial_query_timeout(), Duration::from_secs(10));
        assert_eq!(partial.max_block_size, 50);
    }

    #[test]
    fn test_config_save_and_load() {
        let path = std::env::temp_dir().join(format!("zbota-session-{}.toml", std::process::id()));
        let config = SessionConfig {
            reboot_grace_ms: 5_000,
            max_block_size: 32,
            ..Default::default()
        };

        config.save_to_file(&path).unwrap();
        let loaded = SessionConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(loaded, config);
        assert_eq!(loaded.reboot_grace(), Duration::from_secs(5));
        assert!(SessionConfig::load_from_file(&path).is_err());
    }
}
