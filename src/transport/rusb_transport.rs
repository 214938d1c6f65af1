use std::time::Duration;

use log::{debug, warn};
use rusb::{DeviceHandle, GlobalContext};

use super::{TransportError, UsbTransport, EP_CMD_OUT, EP_DATA_IN, TRANSFER_TIMEOUT};

/// A [`UsbTransport`] backed by `rusb`, scanning for the dongle by
/// Vendor/Product ID, selecting configuration 1 and claiming interface 0.
pub struct RusbTransport {
    vid: u16,
    pid: u16,
    handle: DeviceHandle<GlobalContext>,
    interface: u8,
}

impl RusbTransport {
    /// Opens the first device matching `(vid, pid)`, resets it, selects
    /// configuration 1 and claims interface 0.
    pub fn open(vid: u16, pid: u16) -> Result<Self, TransportError> {
        let handle = Self::open_handle(vid, pid)?;
        Ok(RusbTransport {
            vid,
            pid,
            handle,
            interface: 0,
        })
    }

    fn open_handle(vid: u16, pid: u16) -> Result<DeviceHandle<GlobalContext>, TransportError> {
        let mut handle = rusb::open_device_with_vid_pid(vid, pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        debug!("opened STLink device {:04x}:{:04x}", vid, pid);

        // Some platforms require detaching the kernel driver before we can
        // claim the interface; best-effort, as not every backend supports it.
        let _ = handle.set_auto_detach_kernel_driver(true);

        handle.reset()?;
        handle.set_active_configuration(1)?;
        handle.claim_interface(0)?;

        Ok(handle)
    }
}

impl UsbTransport for RusbTransport {
    fn write_command(&mut self, cmd: &[u8], payload: Option<&[u8]>) -> Result<(), TransportError> {
        let mut frame = [0u8; 16];
        let n = cmd.len().min(16);
        frame[..n].copy_from_slice(&cmd[..n]);

        let written = self
            .handle
            .write_bulk(EP_CMD_OUT, &frame, TRANSFER_TIMEOUT)?;
        if written < frame.len() {
            warn!(
                "short write on command phase ({} of {} bytes) - dongle ignores the tail",
                written,
                frame.len()
            );
        }

        if let Some(payload) = payload {
            let written = self
                .handle
                .write_bulk(EP_CMD_OUT, payload, TRANSFER_TIMEOUT)?;
            if written < payload.len() {
                return Err(TransportError::short("command data-out", payload.len(), written));
            }
        }

        Ok(())
    }

    fn read_response(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; len];
        let n = self.handle.read_bulk(EP_DATA_IN, &mut buf, TRANSFER_TIMEOUT)?;
        if n < len {
            return Err(TransportError::short("command data-in", len, n));
        }

        Ok(buf)
    }

    fn reopen(&mut self) -> Result<(), TransportError> {
        debug!("reopening STLink device {:04x}:{:04x}", self.vid, self.pid);

        let _ = self.handle.release_interface(self.interface);
        // The dongle disconnects and re-enumerates during a DFU-exit; give
        // it a moment before we try to reacquire the handle.
        std::thread::sleep(Duration::from_millis(100));

        self.handle = Self::open_handle(self.vid, self.pid)?;

        Ok(())
    }

    fn device_path(&self) -> String {
        format!("usb:{:04x}:{:04x}", self.vid, self.pid)
    }
}

impl Drop for RusbTransport {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(self.interface);
    }
}
