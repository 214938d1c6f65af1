use thiserror::Error;

use crate::transport::TransportError;

/// The error taxonomy for this crate.
///
/// Variants map directly onto the error kinds a caller needs to branch on:
/// a `Transport` failure during mode-kicking is retryable, a `ChipUnknown`
/// is a warning with a fallback at the call site (not represented as an
/// `Err` variant here), everything else aborts the operation in progress.
#[derive(Error, Debug)]
pub enum Error {
    #[error("USB transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("device VID/PID does not match an STLink dongle (got {vid:#06x}:{pid:#06x})")]
    DeviceMismatch { vid: u16, pid: u16 },

    #[error("flash erase timed out waiting for BSY to clear")]
    FlashEraseTimeout,

    #[error("flash write failed: {0}")]
    FlashWrite(#[from] FlashWriteError),

    #[error("loader stub did not halt within the polling budget")]
    LoaderHangTimeout,

    #[error("verify mismatch at offset {offset:#x}: expected {expected:#04x}, got {actual:#04x}")]
    VerifyMismatch {
        offset: usize,
        expected: u8,
        actual: u8,
    },

    #[error("mode kick failed after exhausting all retries")]
    ModeKickFailed,
}

/// Specific interpretation of a post-chunk `FLASH_SR` read.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum FlashWriteError {
    #[error("wrote a location that was not erased (PGERR)")]
    NotErased,
    #[error("wrote a write-protected region (WRPRTERR)")]
    WriteProtected,
}
