//! The `Session`: one per connected dongle, owning the transport and both
//! scratch buffers, and the target-services operations built on top of the
//! command layer.

use std::convert::TryInto;

use log::{debug, warn};

use crate::chip::{self, ChipDescriptor, CHIP_TABLE, DBGMCU_IDCODE_ADDR, DBGMCU_IDCODE_ADDR_M0};
use crate::command::{
    self, Command, CoreStatus, DfuExit, EnterDebugMode, ExitDebugMode, GetCurrentMode, GetStatus,
    GetVersion, Halt, Mode, ReadAllRegs, ReadCoreId, ReadMem32, ReadOneReg, Reset, Run, Step,
    WriteMem32, WriteMem8, WriteReg,
};
use crate::regs::{RegisterFile, REGISTER_FILE_BYTES};
use crate::transport::{TransportError, UsbTransport};
use crate::{Error, ST_VENDOR_ID, STLINK_V1_PRODUCT_ID, STLINK_V2_PRODUCT_ID};

/// Minimum scratch-buffer size the core contract asks callers/implementors
/// to honor: 6 KiB of data plus a 4-byte command tail.
pub const MIN_SCRATCH_BYTES: usize = 6 * 1024 + 4;

/// Largest single `ReadMem32`/`WriteMem32` transfer, in bytes.
const MAX_MEM_TRANSFER: usize = 1024;

/// Maximum mode-kick retries, 1 second apart.
const MODE_KICK_RETRIES: u32 = 10;

/// Maximum `GetStatus` polls while waiting for a mass-erase/page-erase to
/// clear `BSY` is owned by [`crate::flash`]; this constant is for the
/// core-status polling mode-kicking itself performs.
const MODE_KICK_BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);

/// The decoded 6-byte version descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub stlink_major: u8,
    pub jtag_version: u8,
    pub swim_version: u8,
    pub vid: u16,
    pub pid: u16,
}

impl VersionInfo {
    fn from_wire(buf: &[u8]) -> Self {
        let (version, vid, pid) = command::decode_version(buf);
        VersionInfo {
            stlink_major: ((version >> 12) & 0x0F) as u8,
            jtag_version: ((version >> 6) & 0x3F) as u8,
            swim_version: (version & 0x3F) as u8,
            vid,
            pid,
        }
    }

    pub fn is_v2(&self) -> bool {
        self.pid == STLINK_V2_PRODUCT_ID
    }
}

/// Core run state, refreshed only on an explicit status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Running,
    Halted,
    Unknown,
}

/// One connected dongle. Owns the transport and both scratch buffers
/// exclusively; releases USB resources via `Drop` on every exit path.
pub struct Session {
    transport: Box<dyn UsbTransport>,
    device_path: String,
    core_state: CoreState,
    version: VersionInfo,
    chip_index: Option<usize>,
    idcode: Option<u32>,
    flash_size_kb: Option<u32>,
    cmd_buf: Vec<u8>,
    data_buf: Vec<u8>,
}

impl Session {
    /// Attaches to an already-open transport, verifies VID/PID, and reads
    /// the dongle's version descriptor. Does not perform mode-kicking or
    /// chip identification — callers drive those explicitly.
    pub fn attach(transport: Box<dyn UsbTransport>) -> Result<Self, Error> {
        let device_path = transport.device_path();
        let mut session = Session {
            transport,
            device_path,
            core_state: CoreState::Unknown,
            version: VersionInfo {
                stlink_major: 0,
                jtag_version: 0,
                swim_version: 0,
                vid: 0,
                pid: 0,
            },
            chip_index: None,
            idcode: None,
            flash_size_kb: None,
            cmd_buf: Vec::with_capacity(16),
            data_buf: Vec::with_capacity(MIN_SCRATCH_BYTES),
        };

        session.version = session.get_version()?;

        if session.version.vid != ST_VENDOR_ID
            || (session.version.pid != STLINK_V1_PRODUCT_ID
                && session.version.pid != STLINK_V2_PRODUCT_ID)
        {
            return Err(Error::DeviceMismatch {
                vid: session.version.vid,
                pid: session.version.pid,
            });
        }

        if !session.version.is_v2() {
            warn!(
                "connected to an STLink v1 dongle ({:#06x}); this crate only drives the v2 wire protocol",
                session.version.pid
            );
        }

        Ok(session)
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    pub fn version(&self) -> VersionInfo {
        self.version
    }

    pub fn core_state(&self) -> CoreState {
        self.core_state
    }

    pub fn chip(&self) -> &'static ChipDescriptor {
        &CHIP_TABLE[self.chip_index.unwrap_or(0)]
    }

    fn send(&mut self, cmd: &dyn Command, response_len: usize) -> Result<Vec<u8>, TransportError> {
        self.cmd_buf.clear();
        self.cmd_buf.extend_from_slice(&cmd.encode());
        self.transport.write_command(&self.cmd_buf, None)?;
        self.transport.read_response(response_len)
    }

    fn send_with_payload(
        &mut self,
        cmd: &dyn Command,
        payload: &[u8],
        response_len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        self.cmd_buf.clear();
        self.cmd_buf.extend_from_slice(&cmd.encode());
        self.transport.write_command(&self.cmd_buf, Some(payload))?;
        self.transport.read_response(response_len)
    }

    pub fn get_version(&mut self) -> Result<VersionInfo, Error> {
        let buf = self.send(&GetVersion, 6)?;
        Ok(VersionInfo::from_wire(&buf))
    }

    fn get_current_mode(&mut self) -> Result<Mode, Error> {
        let buf = self.send(&GetCurrentMode, 2)?;
        let raw = command::decode_mode(&buf);
        Mode::from_wire(raw).ok_or_else(|| Error::Protocol(format!("unknown mode byte {:#x}", raw)))
    }

    fn get_status(&mut self) -> Result<CoreState, Error> {
        let buf = self.send(&GetStatus, 2)?;
        match CoreStatus::from_wire(buf[0]) {
            Some(CoreStatus::Running) => Ok(CoreState::Running),
            Some(CoreStatus::Halted) => Ok(CoreState::Halted),
            None => Err(Error::Protocol(format!("unexpected status byte {:#x}", buf[0]))),
        }
    }

    /// Refreshes and returns the core's current run state.
    pub fn status(&mut self) -> Result<CoreState, Error> {
        let state = self.get_status()?;
        self.core_state = state;
        Ok(state)
    }

    fn enter_swd(&mut self) -> Result<(), Error> {
        let buf = self.send(&EnterDebugMode { swd: true }, 2)?;
        if buf[0] != CoreStatus::RUNNING_BYTE && buf[0] != CoreStatus::HALTED_BYTE {
            return Err(Error::Protocol(format!(
                "enter-SWD returned unexpected status {:#x}",
                buf[0]
            )));
        }
        Ok(())
    }

    /// Moves the dongle out of mass-storage/DFU and into debug mode,
    /// retrying the DFU-exit/reopen cycle up to [`MODE_KICK_RETRIES`] times
    /// with a 1-second back-off.
    pub fn mode_kick(&mut self) -> Result<(), Error> {
        let mode = self.get_current_mode()?;

        if mode != Mode::Debug && mode != Mode::MassStorage {
            debug!("mode-kicking: current mode is {:?}, exiting DFU", mode);
            self.send(&DfuExit, 0)?;
            self.transport.reopen()?;

            let mut kicked = false;
            for attempt in 1..=MODE_KICK_RETRIES {
                debug!("mode-kick retry {}/{}", attempt, MODE_KICK_RETRIES);

                if let Err(e) = self.transport.reopen() {
                    warn!("mode-kick reopen failed on attempt {}: {}", attempt, e);
                    std::thread::sleep(MODE_KICK_BACKOFF);
                    continue;
                }

                if self.enter_swd().is_ok() {
                    if matches!(self.get_status(), Ok(CoreState::Running) | Ok(CoreState::Halted)) {
                        kicked = true;
                        break;
                    }
                }

                std::thread::sleep(MODE_KICK_BACKOFF);
            }

            if !kicked {
                return Err(Error::ModeKickFailed);
            }
        }

        self.enter_swd()?;

        match self.get_current_mode() {
            Ok(Mode::Debug) => {}
            Ok(other) => warn!("expected Debug mode after mode-kick, got {:?}", other),
            Err(e) => warn!("could not verify mode after mode-kick: {}", e),
        }

        Ok(())
    }

    pub fn exit_debug(&mut self) -> Result<(), Error> {
        self.send(&ExitDebugMode, 0)?;
        Ok(())
    }

    pub fn run(&mut self) -> Result<(), Error> {
        self.send(&Run, 2)?;
        self.core_state = CoreState::Running;
        Ok(())
    }

    pub fn halt(&mut self) -> Result<(), Error> {
        self.send(&Halt, 2)?;
        self.core_state = CoreState::Halted;
        Ok(())
    }

    pub fn step(&mut self) -> Result<(), Error> {
        self.send(&Step, 2)?;
        self.core_state = CoreState::Halted;
        Ok(())
    }

    pub fn reset(&mut self) -> Result<(), Error> {
        self.send(&Reset, 2)?;
        self.core_state = CoreState::Halted;
        Ok(())
    }

    pub fn read_reg(&mut self, index: u8) -> Result<u32, Error> {
        let buf = self.send(&ReadOneReg { index }, 4)?;
        Ok(u32::from_le_bytes(buf[0..4].try_into().unwrap()))
    }

    pub fn write_reg(&mut self, index: u8, value: u32) -> Result<(), Error> {
        self.send(&WriteReg { index, value }, 2)?;
        Ok(())
    }

    pub fn read_all_regs(&mut self) -> Result<RegisterFile, Error> {
        let buf = self.send(&ReadAllRegs, REGISTER_FILE_BYTES)?;
        Ok(RegisterFile::from_wire(&buf))
    }

    /// Single aligned `ReadMem32` call of at most [`MAX_MEM_TRANSFER`] bytes.
    /// `addr` must be 4-aligned and `len` a multiple of 4.
    fn read_mem32_chunk(&mut self, addr: u32, len: u16) -> Result<Vec<u8>, Error> {
        debug_assert_eq!(addr & 0x3, 0);
        debug_assert_eq!(len % 4, 0);
        Ok(self.send(&ReadMem32 { addr, len }, len as usize)?)
    }

    /// Memory read with arbitrary alignment and length.
    ///
    /// For all `a, n`: `read(a, n)` returns exactly `n` bytes, and an
    /// unaligned `a` yields the same bytes as `read(a & !3, n + (a & 3))`
    /// sliced by `(a & 3)`.
    pub fn read(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(len);
        let mut cursor = addr;
        let mut remaining = len;

        let misalignment = (addr & 0x3) as usize;
        if misalignment != 0 {
            let aligned = addr & !0x3;
            let chunk = self.read_mem32_chunk(aligned, 4)?;
            let prefix_len = (4 - misalignment).min(remaining);
            out.extend_from_slice(&chunk[misalignment..misalignment + prefix_len]);
            cursor = aligned + 4;
            remaining -= prefix_len;
        }

        while remaining > 0 {
            let this_chunk = remaining.min(MAX_MEM_TRANSFER);
            let wire_len = (this_chunk + 3) & !0x3; // round up to a multiple of 4 for transport
            let chunk = self.read_mem32_chunk(cursor, wire_len as u16)?;
            out.extend_from_slice(&chunk[..this_chunk]);
            cursor += wire_len as u32;
            remaining -= this_chunk;
        }

        Ok(out)
    }

    /// `addr` must be 4-aligned; `data.len()` must be a multiple of 4.
    pub fn write_mem32(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        assert_eq!(addr & 0x3, 0, "write_mem32 requires a 4-aligned address");
        assert_eq!(data.len() % 4, 0, "write_mem32 requires a length that is a multiple of 4");

        let mut cursor = addr;
        for chunk in data.chunks(MAX_MEM_TRANSFER) {
            self.data_buf.clear();
            self.data_buf.extend_from_slice(chunk);
            self.send_with_payload(
                &WriteMem32 {
                    addr: cursor,
                    len: chunk.len() as u16,
                },
                &self.data_buf.clone(),
                0,
            )?;
            cursor += chunk.len() as u32;
        }

        Ok(())
    }

    /// `data.len()` must be at most 64 bytes.
    pub fn write_mem8(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        assert!(data.len() <= 64, "write_mem8 is limited to 64 bytes per call");
        self.send_with_payload(
            &WriteMem8 {
                addr,
                len: data.len() as u16,
            },
            data,
            0,
        )?;
        Ok(())
    }

    /// Reads `DBGMCU_IDCODE`, falling back to the Cortex-M0 address if the
    /// primary address reads zero, then looks the idcode up in
    /// [`CHIP_TABLE`]. An unmatched idcode is downgraded to a warning and
    /// the generic fallback descriptor (index 0) is used — this never
    /// returns `Err`.
    pub fn identify_chip(&mut self) -> Result<usize, Error> {
        let mut idcode = u32::from_le_bytes(
            self.read(DBGMCU_IDCODE_ADDR, 4)?.try_into().unwrap(),
        );

        if idcode == 0 {
            debug!("DBGMCU_IDCODE read as zero, falling back to the Cortex-M0 address");
            idcode = u32::from_le_bytes(
                self.read(DBGMCU_IDCODE_ADDR_M0, 4)?.try_into().unwrap(),
            );
        }

        let index = chip::lookup_by_idcode(idcode);
        if index == 0 && idcode != 0 {
            warn!("DBGMCU_IDCODE {:#010x} did not match any known chip; using the generic fallback descriptor", idcode);
        }

        self.chip_index = Some(index);
        self.idcode = Some(idcode);
        self.flash_size_kb = Some(CHIP_TABLE[index].flash_size / 1024);

        if let Ok(core_id) = self.send(&ReadCoreId, 4).map(|b| u32::from_le_bytes(b[0..4].try_into().unwrap())) {
            if !matches_core_id_pattern(core_id) {
                warn!(
                    "SWD core ID {:#010x} does not match the expected *B**1477 pattern",
                    core_id
                );
            }
        }

        Ok(index)
    }

    pub fn cached_idcode(&self) -> Option<u32> {
        self.idcode
    }

    pub fn flash_size_kb(&self) -> Option<u32> {
        self.flash_size_kb
    }
}

/// Sanity-checks the SWD core ID after chip identification against the
/// expected nibble pattern `*B**1477`.
fn matches_core_id_pattern(core_id: u32) -> bool {
    (core_id & 0x0F00_FFFF) == 0x0B00_1477
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn attached_session() -> Session {
        let transport = MockTransport::stm32f100();
        Session::attach(Box::new(transport)).unwrap()
    }

    #[test]
    fn get_version_reports_stlink_v2_vid_pid() {
        let mut session = attached_session();
        let version = session.get_version().unwrap();
        assert_eq!(version.vid, ST_VENDOR_ID);
        assert_eq!(version.pid, STLINK_V2_PRODUCT_ID);
    }

    #[test]
    fn mode_kick_reports_debug_mode() {
        let mut session = attached_session();
        session.mode_kick().unwrap();
        assert_eq!(session.get_current_mode().unwrap(), Mode::Debug);
    }

    #[test]
    fn identify_chip_matches_stm32f100() {
        let mut session = attached_session();
        session.mode_kick().unwrap();
        let idx = session.identify_chip().unwrap();
        assert_eq!(session.chip().name, "STM32F100");
        assert_eq!(idx, chip::lookup_by_idcode(0x1001_6420));
    }

    #[test]
    fn unaligned_read_matches_aligned_slice_property() {
        let mut session = attached_session();
        session.mode_kick().unwrap();

        let addr = session.chip().sram_base + 2;
        let direct = session.read(addr, 6).unwrap();

        let aligned = session.read(addr & !3, 6 + (addr & 3) as usize).unwrap();
        let sliced = &aligned[(addr & 3) as usize..(addr & 3) as usize + 6];

        assert_eq!(direct, sliced);
    }

    #[test]
    fn register_write_then_read_round_trips_when_halted() {
        let mut session = attached_session();
        session.mode_kick().unwrap();
        session.halt().unwrap();

        session.write_reg(3, 0x1234_5678).unwrap();
        assert_eq!(session.read_reg(3).unwrap(), 0x1234_5678);
    }
}
