//! Host-side protocol engine for STMicro STLink v2 dongles.
//!
//! This crate frames the STLink's bulk-endpoint command protocol, drives
//! ARM Cortex-M core debug (halt/run/step/register access/memory
//! read-write), and implements the download-and-run flash programmer that
//! stages a small Thumb-2 loader stub into target SRAM because the dongle
//! itself cannot emit the 16-bit bus cycles STM32 flash programming needs.

pub mod chip;
pub mod command;
mod error;
pub mod flash;
pub mod loader;
pub mod regs;
pub mod session;
pub mod transport;

pub use chip::{ChipDescriptor, ChipFamily, CHIP_TABLE};
pub use error::{Error, FlashWriteError};
pub use regs::RegisterFile;
pub use session::{CoreState, Session, VersionInfo};
pub use transport::UsbTransport;

/// The STLink vendor ID. Fixed by the hardware; see [`VersionInfo`].
pub const ST_VENDOR_ID: u16 = 0x0483;
/// STLink v1 product ID. Accepted for identification only; the wire
/// protocol in this crate requires v2.
pub const STLINK_V1_PRODUCT_ID: u16 = 0x3744;
/// STLink v2 product ID. The only variant this crate drives.
pub const STLINK_V2_PRODUCT_ID: u16 = 0x3748;

/// Page address sentinel meaning "erase all user flash" rather than a
/// specific page.
pub const MASS_ERASE_SENTINEL: u32 = 0xA11;
