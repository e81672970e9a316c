//! Everything that touches the physical reader.
//!
//! This crate is only ever linked into the worker side of the binary. The
//! agent process talks to it exclusively through the stdio message channel
//! run by [`worker::serve`].

pub mod apdu;
pub mod driver;
pub mod ndef;
pub mod worker;
mod write;

use thiserror::Error;

pub use driver::{ReaderDriver, ReaderEvent, open_default};
pub use worker::{WorkerOptions, serve};
pub use write::{TagLayout, write_url};

#[derive(Debug, Error)]
pub enum HardwareError {
    /// The driver could not be initialised at all (no service, no support).
    #[error("reader driver unavailable: {0}")]
    Unavailable(String),
    /// A driver call failed. `fatal` errors end the worker so the supervisor
    /// can restart it with a fresh driver context.
    #[error("reader driver error: {message}")]
    Driver { message: String, fatal: bool },
    #[error("tag rejected command (SW1={sw1:02X} SW2={sw2:02X})")]
    Status { sw1: u8, sw2: u8 },
    #[error("no tag present on reader {0}")]
    NoTag(String),
    #[error("NDEF message needs {needed} bytes but the tag holds {available}")]
    Capacity { needed: usize, available: usize },
}

impl HardwareError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Driver { fatal: true, .. })
    }
}
