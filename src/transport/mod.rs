//! The USB bulk-endpoint transport.
//!
//! Contract only: a [`UsbTransport`] offers `(out_pipe, bytes) -> status`
//! and `(in_pipe, len) -> (bytes, status)` with a per-call timeout. Device
//! enumeration by Vendor/Product ID, configuration selection, and interface
//! claiming are the concrete transport's job; the rest of this crate never
//! reaches for a platform USB API directly.

pub mod mock;
pub mod rusb_transport;

use std::time::Duration;

use thiserror::Error;

pub use mock::MockTransport;
pub use rusb_transport::RusbTransport;

/// Bulk OUT endpoint: commands and host-to-device payload.
pub const EP_CMD_OUT: u8 = 0x02;
/// Bulk IN endpoint: device-to-host responses.
pub const EP_DATA_IN: u8 = 0x81;
/// Bulk IN endpoint: unused by this protocol, present on the hardware.
#[allow(dead_code)]
pub const EP_UNUSED_IN: u8 = 0x83;

/// Per-call timeout for every USB bulk transfer.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_millis(800);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("short transfer on {0}: expected {expected} bytes, got {actual}")]
    ShortTransfer {
        phase: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("no STLink dongle found (VID {vid:#06x} PID {pid:#06x})")]
    DeviceNotFound { vid: u16, pid: u16 },
}

impl TransportError {
    pub fn short(phase: &'static str, expected: usize, actual: usize) -> Self {
        TransportError::ShortTransfer {
            phase,
            expected,
            actual,
        }
    }
}

/// The USB bulk transport contract the command layer is built on.
///
/// Implementations own the platform device handle. `reopen` closes and
/// re-establishes the USB connection; it exists because the dongle
/// disconnects and re-enumerates as part of DFU-exit during mode kicking,
/// and the transport is the only layer that knows how to re-attach to it.
pub trait UsbTransport {
    /// Writes `cmd` (at most 16 bytes) to the command OUT endpoint, followed
    /// immediately by `payload` if present (host-to-device data phase).
    fn write_command(&mut self, cmd: &[u8], payload: Option<&[u8]>) -> Result<(), TransportError>;

    /// Reads exactly `len` bytes from the data IN endpoint (device-to-host
    /// data phase). A short read here is a hard error for the caller.
    fn read_response(&mut self, len: usize) -> Result<Vec<u8>, TransportError>;

    /// Closes and reopens the underlying device handle.
    fn reopen(&mut self) -> Result<(), TransportError>;

    /// A human-readable label for the device path, used in diagnostics.
    fn device_path(&self) -> String;
}
