//! zbota-core: Zigbee OTA upgrade engine in Rust.
//!
//! This crate implements the server side of the Zigbee OTA Upgrade cluster:
//! it parses upgrade files, finds firmware for a device through
//! vendor-specific backends and drives the device through the
//! notify/query/block/end handshake.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Cluster constants, status codes, command payloads
//! - **Image**: Upgrade file codec
//! - **Transport**: Device abstraction (`OtaDevice`, mock)
//! - **Waiter**: Cancellable, deadline-bounded waits
//! - **State**: Session states, progress and pacing
//! - **Events**: Observer pattern for callers
//! - **Session**: The update state machine
//! - **Availability**: Update checks without a transfer
//! - **Backend**: Firmware sources (JSON indexes, page scraping, no-op)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use zbota_core::backend::{BackendConfig, HttpFetcher, backend_for_manufacturer};
//! use zbota_core::session::{SessionConfig, UpdateSession};
//! use zbota_core::transport::OtaDevice;
//!
//! async fn upgrade(device: &dyn OtaDevice) -> anyhow::Result<()> {
//!     let fetcher = Arc::new(HttpFetcher::new()?);
//!     let backend = backend_for_manufacturer("ubisys", fetcher, &BackendConfig::default());
//!
//!     let mut session = UpdateSession::new(SessionConfig::default());
//!     let version = session.perform_update(device, backend.as_ref()).await?;
//!     println!("Now running 0x{:08X}", version);
//!     Ok(())
//! }
//! ```

pub mod availability;
pub mod backend;
pub mod error;
pub mod events;
pub mod identity;
pub mod image;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;
pub mod waiter;

// Re-exports for convenience
pub use availability::check_available;
pub use backend::{
    Backend, BackendConfig, FetchError, Fetcher, HttpFetcher, IndexBackend, IndexFormat,
    NoopBackend, OtaConfig, ScrapeBackend, backend_for_manufacturer,
};
pub use error::OtaError;
pub use events::{LogLevel, NullObserver, OtaEvent, OtaObserver, TracingObserver};
pub use identity::DeviceFirmwareIdentity;
pub use image::{
    FirmwareFormat, Image, ImageError, ImageHeader, SubElement, detect_format, find_image_start,
    verify_image_data,
};
pub use protocol::OtaStatus;
pub use session::{SessionConfig, UpdateSession, perform_update};
pub use state::SessionState;
pub use transport::{MockDevice, OtaDevice, TransportError};
pub use waiter::{CancelGroup, WaitError, Waiter};
