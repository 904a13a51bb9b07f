//! Deadline-bounded, cancellable waits for inbound commands.
//!
//! Every wait of one update session is created through a [`CancelGroup`].
//! Canceling the group (explicitly, through its parent token, or by
//! dropping it) resolves every outstanding [`Waiter`] with
//! [`WaitError::Canceled`].

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::protocol::{InboundFrame, InboundKind, OTA_CLUSTER_ID};
use crate::transport::{OtaDevice, TransportError};

#[derive(Error, Debug)]
pub enum WaitError {
    #[error("Timed out after {timeout:?} waiting for {kind}")]
    Timeout { kind: InboundKind, timeout: Duration },

    #[error("Wait for {kind} canceled")]
    Canceled { kind: InboundKind },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Cancellation scope shared by all waiters of one session.
#[derive(Debug)]
pub struct CancelGroup {
    token: CancellationToken,
    armed: AtomicUsize,
}

impl Default for CancelGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelGroup {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            armed: AtomicUsize::new(0),
        }
    }

    /// A group that is also canceled when `parent` is.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            armed: AtomicUsize::new(0),
        }
    }

    /// Start waiting for the next `kind` command from `endpoint`.
    ///
    /// The wait is registered with the device and the deadline starts
    /// here, not at first poll. A command that arrives before the waiter is
    /// polled is not lost.
    pub fn await_command<'a>(
        &self,
        device: &'a dyn OtaDevice,
        endpoint: u8,
        kind: InboundKind,
        timeout: Duration,
    ) -> Waiter<'a> {
        self.armed.fetch_add(1, Ordering::Relaxed);
        let token = self.token.child_token();
        let canceled = token.clone();
        let wait = device.wait_for_command(endpoint, OTA_CLUSTER_ID, kind);
        let deadline = Instant::now() + timeout;

        let inner = async move {
            tokio::select! {
                biased;
                _ = canceled.cancelled() => Err(WaitError::Canceled { kind }),
                result = tokio::time::timeout_at(deadline, wait) => match result {
                    Ok(Ok(frame)) if frame.command.kind() == kind => Ok(frame),
                    Ok(Ok(frame)) => Err(TransportError::UnexpectedCommand {
                        expected: kind,
                        actual: frame.command.kind(),
                    }
                    .into()),
                    Ok(Err(e)) => Err(e.into()),
                    Err(_) => Err(WaitError::Timeout { kind, timeout }),
                },
            }
        }
        .boxed();

        Waiter { kind, token, inner }
    }

    /// Cancel every waiter created by this group. Calling it again is a
    /// no-op.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!(armed = self.armed(), "Canceling waiter group");
            self.token.cancel();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of waiters created so far.
    pub fn armed(&self) -> usize {
        self.armed.load(Ordering::Relaxed)
    }

    /// Resolves once the group is canceled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

impl Drop for CancelGroup {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// One outstanding wait. Resolves with the inbound frame, a timeout, or
/// a cancellation.
pub struct Waiter<'a> {
    kind: InboundKind,
    token: CancellationToken,
    inner: BoxFuture<'a, Result<InboundFrame, WaitError>>,
}

impl Waiter<'_> {
    pub fn kind(&self) -> InboundKind {
        self.kind
    }

    /// Cancel just this waiter.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Future for Waiter<'_> {
    type Output = Result<InboundFrame, WaitError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}
