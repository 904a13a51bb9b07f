//! Event system for update sessions.
//!
//! Callers subscribe to session progress through [`OtaObserver`] instead of
//! a bare callback, so a CLI, a service or a test can each decide what to
//! do with it.

use crate::state::SessionState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Events emitted by an update session.
#[derive(Debug, Clone, PartialEq)]
pub enum OtaEvent {
    /// Session state changed.
    PhaseChanged { from: SessionState, to: SessionState },
    /// The backend produced an image for the device.
    ImageResolved { file_version: u32, size: u32 },
    /// An `imageBlockResponse` went out.
    BlockSent { offset: u32, size: u8 },
    /// Transfer progress. `remaining_seconds` is `None` when no estimate
    /// is possible.
    Progress {
        percentage: f64,
        remaining_seconds: Option<u64>,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// The session ended with an error.
    Error { message: String },
    /// The device accepted the new image.
    Complete,
}

/// Observer trait for receiving session events.
pub trait OtaObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &OtaEvent);
}

impl<F> OtaObserver for F
where
    F: Fn(&OtaEvent) + Send + Sync,
{
    fn on_event(&self, event: &OtaEvent) {
        self(event)
    }
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl OtaObserver for NullObserver {
    fn on_event(&self, _event: &OtaEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl OtaObserver for TracingObserver {
    fn on_event(&self, event: &OtaEvent) {
        match event {
            OtaEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            OtaEvent::ImageResolved { file_version, size } => {
                tracing::info!(
                    file_version = %format!("0x{:08X}", file_version),
                    size = size,
                    "Image resolved"
                );
            }
            OtaEvent::BlockSent { offset, size } => {
                tracing::trace!(offset = offset, size = size, "Block sent");
            }
            OtaEvent::Progress {
                percentage,
                remaining_seconds,
            } => match remaining_seconds {
                Some(secs) => {
                    tracing::info!("Update at {:.2}%, ~{} seconds remaining", percentage, secs)
                }
                None => tracing::info!("Update at {:.2}%", percentage),
            },
            OtaEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            OtaEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
            OtaEvent::Complete => {
                tracing::info!("Update complete");
            }
        }
    }
}
