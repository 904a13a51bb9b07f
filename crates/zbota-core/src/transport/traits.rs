//! Device transport abstraction.
//!
//! Defines the `OtaDevice` trait the engine drives. How commands reach the
//! radio (a coordinator adapter, a ZCL stack, a simulator) is up to the
//! implementation.

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::protocol::{InboundFrame, InboundKind, OutboundCommand};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to send {command}: {message}")]
    SendFailed {
        command: &'static str,
        message: String,
    },

    #[error("Waiting for {kind} failed: {message}")]
    WaitFailed { kind: InboundKind, message: String },

    #[error("Expected {expected}, device sent {actual}")]
    UnexpectedCommand {
        expected: InboundKind,
        actual: InboundKind,
    },

    #[error("Device unavailable: {0}")]
    Unavailable(String),
}

/// A Zigbee device reachable through some coordinator.
///
/// This trait enables:
/// - Production implementations on top of a ZCL stack
/// - `MockDevice` for exercising the session state machine in tests
#[async_trait]
pub trait OtaDevice: Send + Sync {
    /// IEEE address, used for logging.
    fn ieee_address(&self) -> &str;

    /// Endpoint exposing the OTA Upgrade cluster as an output cluster.
    fn ota_endpoint(&self) -> Option<u8>;

    /// Send a command to the OTA cluster on `endpoint`.
    ///
    /// `transaction_sequence_number` is set when answering a request.
    async fn send_command(
        &self,
        endpoint: u8,
        command: OutboundCommand,
        transaction_sequence_number: Option<u8>,
    ) -> Result<(), TransportError>;

    /// Wait for the next `kind` command on `cluster` from `endpoint`.
    ///
    /// The wait is registered when this is called, not when the returned
    /// future is first polled. Dropping the future abandons the wait.
    /// Deadlines are applied by the caller.
    fn wait_for_command(
        &self,
        endpoint: u8,
        cluster: u16,
        kind: InboundKind,
    ) -> BoxFuture<'_, Result<InboundFrame, TransportError>>;
}
