//! Reader driver seam.
//!
//! The worker only ever talks to hardware through [`ReaderDriver`]; the real
//! implementation is PC/SC (behind the `pcsc` feature). Without the feature,
//! [`open_default`] fails the same way a host without a reader service would,
//! which the supervisor treats as an ordinary init failure.

#[cfg(feature = "pcsc")]
mod pcsc;

use std::time::Duration;

use crate::HardwareError;

#[cfg(feature = "pcsc")]
pub use self::pcsc::PcscDriver;

/// Something that happened on the reader side since the last poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    ReaderAttached { name: String },
    ReaderDetached { name: String },
    TagPresented { reader: String, uid: String, atr: Vec<u8> },
    TagRemoved { reader: String, uid: String },
    /// Non-fatal I/O problem worth telling the operator about.
    Fault { message: String },
}

/// Blocking access to the reader hardware. Runs on a dedicated thread.
pub trait ReaderDriver: Send {
    /// Wait up to `timeout` for reader or tag changes. An empty vec means
    /// nothing changed.
    fn wait_for_events(&mut self, timeout: Duration) -> Result<Vec<ReaderEvent>, HardwareError>;

    /// Exchange one APDU with the tag currently on `reader`. The returned
    /// bytes include the trailing status word.
    fn transmit(&mut self, reader: &str, apdu: &[u8]) -> Result<Vec<u8>, HardwareError>;
}

/// Open the platform's reader driver.
#[cfg(feature = "pcsc")]
pub fn open_default() -> Result<Box<dyn ReaderDriver>, HardwareError> {
    Ok(Box::new(PcscDriver::open()?))
}

#[cfg(not(feature = "pcsc"))]
pub fn open_default() -> Result<Box<dyn ReaderDriver>, HardwareError> {
    Err(HardwareError::Unavailable(
        "built without PC/SC support (rebuild with --features pcsc)".to_string(),
    ))
}
