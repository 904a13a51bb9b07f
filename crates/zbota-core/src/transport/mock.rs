//! Mock device for testing.
//!
//! `MockDevice` records every command sent to it and every waiter armed on
//! it. Inbound commands come from an optional responder, which plays the
//! device side of the protocol, or from [`MockDevice::push_inbound`].
//! Commands that arrive while nobody waits are kept until a waiter arms.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::traits::{OtaDevice, TransportError};
use crate::identity::DeviceFirmwareIdentity;
use crate::protocol::{
    ImageBlockRequest, ImageBlockResponse, ImagePageRequest, InboundCommand, InboundFrame,
    InboundKind, OtaStatus, OutboundCommand, QUERY_FIELD_CONTROL_HARDWARE_VERSION,
    QueryNextImageRequest, QueryNextImageResponse, UpgradeEndRequest,
};

/// Device-side reaction to a command the engine sent.
pub type Responder = Box<dyn Fn(&OutboundCommand) -> Vec<InboundFrame> + Send + Sync>;

/// A command the mock accepted.
#[derive(Debug, Clone)]
pub struct SentCommand {
    pub endpoint: u8,
    pub command: OutboundCommand,
    pub transaction_sequence_number: Option<u8>,
    pub at: Instant,
}

#[derive(Default)]
struct MockState {
    /// Inbound commands nobody was waiting for yet.
    mailbox: HashMap<InboundKind, VecDeque<InboundFrame>>,
    waiters: Vec<(InboundKind, oneshot::Sender<InboundFrame>)>,
    sent: Vec<SentCommand>,
    armed: Vec<InboundKind>,
    failed_sends: usize,
    fail_block_responses: usize,
}

/// Mock transport for unit testing session logic.
pub struct MockDevice {
    ieee_address: String,
    endpoint: Option<u8>,
    responder: Option<Responder>,
    state: Mutex<MockState>,
}

impl MockDevice {
    /// A silent device: it never answers on its own.
    pub fn new(ieee_address: impl Into<String>, endpoint: Option<u8>) -> Self {
        Self {
            ieee_address: ieee_address.into(),
            endpoint,
            responder: None,
            state: Mutex::new(MockState::default()),
        }
    }

    /// A device that reacts to each sent command through `responder`.
    pub fn with_responder(
        ieee_address: impl Into<String>,
        endpoint: Option<u8>,
        responder: Responder,
    ) -> Self {
        Self {
            responder: Some(responder),
            ..Self::new(ieee_address, endpoint)
        }
    }

    /// Deliver an inbound command as if the device had sent it.
    pub fn push_inbound(&self, frame: InboundFrame) {
        let mut state = self.state();
        let kind = frame.command.kind();
        let mut frame = frame;
        while let Some(index) = state.waiters.iter().position(|(k, _)| *k == kind) {
            let (_, sender) = state.waiters.remove(index);
            match sender.send(frame) {
                Ok(()) => return,
                // Waiter was dropped; try the next one.
                Err(returned) => frame = returned,
            }
        }
        state.mailbox.entry(kind).or_default().push_back(frame);
    }

    /// Make the next `count` block responses fail to send. The device
    /// retries each failed block.
    pub fn fail_block_responses(&self, count: usize) {
        self.state().fail_block_responses = count;
    }

    /// All commands accepted so far.
    pub fn sent(&self) -> Vec<SentCommand> {
        self.state().sent.clone()
    }

    /// Sent commands with the given name.
    pub fn sent_named(&self, name: &str) -> Vec<SentCommand> {
        self.state()
            .sent
            .iter()
            .filter(|s| s.command.name() == name)
            .cloned()
            .collect()
    }

    /// Number of sends that were made to fail.
    pub fn failed_sends(&self) -> usize {
        self.state().failed_sends
    }

    /// Kinds of every waiter armed so far, in order.
    pub fn armed(&self) -> Vec<InboundKind> {
        self.state().armed.clone()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl OtaDevice for MockDevice {
    fn ieee_address(&self) -> &str {
        &self.ieee_address
    }

    fn ota_endpoint(&self) -> Option<u8> {
        self.endpoint
    }

    async fn send_command(
        &self,
        endpoint: u8,
        command: OutboundCommand,
        transaction_sequence_number: Option<u8>,
    ) -> Result<(), TransportError> {
        let retry = {
            let mut state = self.state();
            match &command {
                OutboundCommand::ImageBlockResponse(response) if state.fail_block_responses > 0 => {
                    state.fail_block_responses -= 1;
                    state.failed_sends += 1;
                    Some(ImageBlockRequest {
                        field_control: 0,
                        manufacturer_code: response.manufacturer_code,
                        image_type: response.image_type,
                        file_version: response.file_version,
                        file_offset: response.file_offset,
                        maximum_data_size: response.data_size.max(1),
                    })
                }
                _ => {
                    state.sent.push(SentCommand {
                        endpoint,
                        command: command.clone(),
                        transaction_sequence_number,
                        at: Instant::now(),
                    });
                    None
                }
            }
        };

        if let Some(request) = retry {
            self.push_inbound(InboundFrame::new(InboundCommand::ImageBlockRequest(request)));
            return Err(TransportError::SendFailed {
                command: command.name(),
                message: "MAC ACK timeout".to_string(),
            });
        }

        if let Some(responder) = &self.responder {
            for frame in responder(&command) {
                self.push_inbound(frame);
            }
        }
        Ok(())
    }

    fn wait_for_command(
        &self,
        _endpoint: u8,
        _cluster: u16,
        kind: InboundKind,
    ) -> BoxFuture<'_, Result<InboundFrame, TransportError>> {
        let mut state = self.state();
        state.armed.push(kind);
        if let Some(frame) = state.mailbox.get_mut(&kind).and_then(VecDeque::pop_front) {
            return futures::future::ready(Ok(frame)).boxed();
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.push((kind, tx));
        async move {
            rx.await.map_err(|_| TransportError::WaitFailed {
                kind,
                message: "mock device dropped".to_string(),
            })
        }
        .boxed()
    }
}

/// Responder for a device that upgrades cleanly.
///
/// Answers `imageNotify` with `identity`, fetches the offered image in
/// `block_size` chunks and finally reports `end_status`.
pub fn well_behaved_device(
    identity: DeviceFirmwareIdentity,
    block_size: u8,
    end_status: OtaStatus,
) -> Responder {
    let image_size = AtomicU32::new(0);
    let tsn = AtomicU8::new(0);
    Box::new(move |command: &OutboundCommand| {
        let next_tsn = || tsn.fetch_add(1, Ordering::Relaxed);
        match command {
            OutboundCommand::ImageNotify(_) => {
                vec![InboundFrame::with_tsn(query_request(&identity), next_tsn())]
            }
            OutboundCommand::QueryNextImageResponse(response) if response.status.is_success() => {
                // Only the first offer starts a transfer.
                if image_size.swap(response.image_size, Ordering::Relaxed) != 0 {
                    return Vec::new();
                }
                vec![InboundFrame::with_tsn(
                    InboundCommand::ImageBlockRequest(ImageBlockRequest {
                        field_control: 0,
                        manufacturer_code: response.manufacturer_code,
                        image_type: response.image_type,
                        file_version: response.file_version,
                        file_offset: 0,
                        maximum_data_size: block_size,
                    }),
                    next_tsn(),
                )]
            }
            OutboundCommand::ImageBlockResponse(response) => {
                let next = response.file_offset + u32::from(response.data_size);
                let command = if next >= image_size.load(Ordering::Relaxed) {
                    InboundCommand::UpgradeEndRequest(UpgradeEndRequest {
                        status: end_status,
                        manufacturer_code: response.manufacturer_code,
                        image_type: response.image_type,
                        file_version: response.file_version,
                    })
                } else {
                    InboundCommand::ImageBlockRequest(ImageBlockRequest {
                        field_control: 0,
                        manufacturer_code: response.manufacturer_code,
                        image_type: response.image_type,
                        file_version: response.file_version,
                        file_offset: next,
                        maximum_data_size: block_size,
                    })
                };
                vec![InboundFrame::with_tsn(command, next_tsn())]
            }
            _ => Vec::new(),
        }
    })
}

/// Responder for a device that fetches the image a page at a time.
///
/// Each `imagePageRequest` asks for `page_size` bytes in blocks of at most
/// `block_size`. The next page is requested once the current one has been
/// received in full.
pub fn paging_device(
    identity: DeviceFirmwareIdentity,
    page_size: u16,
    block_size: u8,
    end_status: OtaStatus,
) -> Responder {
    let image_size = AtomicU32::new(0);
    let tsn = AtomicU8::new(0);
    let page = move |offset: u32, source: &ImageBlockResponse| ImagePageRequest {
        field_control: 0,
        manufacturer_code: source.manufacturer_code,
        image_type: source.image_type,
        file_version: source.file_version,
        file_offset: offset,
        maximum_data_size: block_size,
        page_size,
        response_spacing: 0,
        request_node_address: None,
    };
    Box::new(move |command: &OutboundCommand| {
        let next_tsn = || tsn.fetch_add(1, Ordering::Relaxed);
        match command {
            OutboundCommand::ImageNotify(_) => {
                vec![InboundFrame::with_tsn(query_request(&identity), next_tsn())]
            }
            OutboundCommand::QueryNextImageResponse(response) if response.status.is_success() => {
                if image_size.swap(response.image_size, Ordering::Relaxed) != 0 {
                    return Vec::new();
                }
                let first = page(0, &offered_block(response));
                vec![InboundFrame::with_tsn(
                    InboundCommand::ImagePageRequest(first),
                    next_tsn(),
                )]
            }
            OutboundCommand::ImageBlockResponse(response) => {
                let next = response.file_offset + u32::from(response.data_size);
                if next >= image_size.load(Ordering::Relaxed) {
                    let end = UpgradeEndRequest {
                        status: end_status,
                        manufacturer_code: response.manufacturer_code,
                        image_type: response.image_type,
                        file_version: response.file_version,
                    };
                    vec![InboundFrame::with_tsn(
                        InboundCommand::UpgradeEndRequest(end),
                        next_tsn(),
                    )]
                } else if next % u32::from(page_size.max(1)) == 0 {
                    vec![InboundFrame::with_tsn(
                        InboundCommand::ImagePageRequest(page(next, response)),
                        next_tsn(),
                    )]
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    })
}

fn query_request(identity: &DeviceFirmwareIdentity) -> InboundCommand {
    InboundCommand::QueryNextImageRequest(QueryNextImageRequest {
        field_control: if identity.hardware_version.is_some() {
            QUERY_FIELD_CONTROL_HARDWARE_VERSION
        } else {
            0
        },
        manufacturer_code: identity.manufacturer_code,
        image_type: identity.image_type,
        file_version: identity.file_version,
        hardware_version: identity.hardware_version,
    })
}

/// An empty block response naming the offered image.
fn offered_block(response: &QueryNextImageResponse) -> ImageBlockResponse {
    ImageBlockResponse {
        status: OtaStatus::SUCCESS,
        manufacturer_code: response.manufacturer_code,
        image_type: response.image_type,
        file_version: response.file_version,
        file_offset: 0,
        data_size: 0,
        data: Vec::new(),
    }
}
