//! Transport layer module.

pub mod mock;
pub mod traits;

pub use mock::{MockDevice, Responder, SentCommand, paging_device, well_behaved_device};
pub use traits::{OtaDevice, TransportError};
