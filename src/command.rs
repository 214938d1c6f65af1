//! The STLink command-opcode/sub-opcode layer.
//!
//! Every wire command is a small struct implementing [`Command`]; every
//! fixed-shape response is decoded by a free function next to the command
//! that produces it. All multi-byte fields are little-endian, packed by
//! explicit byte slicing — never by type punning or a runtime endianness
//! check.

use std::convert::TryFrom;

use num_enum::TryFromPrimitive;

/// Dongle command prefix: `GetVersion`.
pub const CMD_GET_VERSION: u8 = 0xF1;
/// Dongle command prefix: DFU sub-commands.
pub const CMD_DFU: u8 = 0xF3;
/// Dongle command prefix: `GetCurrentMode`.
pub const CMD_GET_CURRENT_MODE: u8 = 0xF5;
/// Debug command prefix; second byte is a sub-opcode.
pub const CMD_DEBUG: u8 = 0xF2;

pub const DFU_EXIT: u8 = 0x07;

pub const DEBUG_GETSTATUS: u8 = 0x01;
pub const DEBUG_FORCEDEBUG: u8 = 0x02; // halt
pub const DEBUG_RESETSYS: u8 = 0x03;
pub const DEBUG_READALLREGS: u8 = 0x04;
pub const DEBUG_READREG: u8 = 0x05;
pub const DEBUG_WRITEREG: u8 = 0x06;
pub const DEBUG_READMEM_32BIT: u8 = 0x07;
pub const DEBUG_WRITEMEM_32BIT: u8 = 0x08;
pub const DEBUG_RUNCORE: u8 = 0x09;
pub const DEBUG_STEPCORE: u8 = 0x0A;
pub const DEBUG_WRITEMEM_8BIT: u8 = 0x0D;
pub const DEBUG_ENTER_MODE: u8 = 0x20;
pub const DEBUG_EXIT_MODE: u8 = 0x21;
pub const DEBUG_READCOREID: u8 = 0x22;

pub const ENTER_MODE_SWD: u8 = 0xA3;
pub const ENTER_MODE_JTAG: u8 = 0x00;

/// Mode reported by `GetCurrentMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum Mode {
    Dfu = 0,
    MassStorage = 1,
    Debug = 2,
    Swim = 3,
    Bootloader = 4,
}

impl Mode {
    pub fn from_wire(value: u16) -> Option<Mode> {
        Mode::try_from(value).ok()
    }
}

/// Status byte meaning, low byte significant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum CoreStatus {
    Running = 0x80,
    Halted = 0x81,
}

impl CoreStatus {
    pub const RUNNING_BYTE: u8 = Self::Running as u8;
    pub const HALTED_BYTE: u8 = Self::Halted as u8;

    pub fn from_wire(byte: u8) -> Option<CoreStatus> {
        CoreStatus::try_from(byte).ok()
    }
}

/// A command frame: at most 16 meaningful bytes, zero-padded by the
/// transport.
pub trait Command {
    fn encode(&self) -> Vec<u8>;
}

pub struct GetVersion;
impl Command for GetVersion {
    fn encode(&self) -> Vec<u8> {
        vec![CMD_GET_VERSION]
    }
}

/// Decodes the 6-byte `GetVersion` response into its three fields: the
/// packed big-endian version word, and the little-endian VID/PID tail.
pub fn decode_version(buf: &[u8]) -> (u16, u16, u16) {
    let version = u16::from_be_bytes([buf[0], buf[1]]);
    let vid = u16::from_le_bytes([buf[2], buf[3]]);
    let pid = u16::from_le_bytes([buf[4], buf[5]]);
    (version, vid, pid)
}

pub struct DfuExit;
impl Command for DfuExit {
    fn encode(&self) -> Vec<u8> {
        vec![CMD_DFU, DFU_EXIT]
    }
}

pub struct GetCurrentMode;
impl Command for GetCurrentMode {
    fn encode(&self) -> Vec<u8> {
        vec![CMD_GET_CURRENT_MODE]
    }
}

pub fn decode_mode(buf: &[u8]) -> u16 {
    u16::from_le_bytes([buf[0], buf[1]])
}

pub struct EnterDebugMode {
    pub swd: bool,
}
impl Command for EnterDebugMode {
    fn encode(&self) -> Vec<u8> {
        let param = if self.swd { ENTER_MODE_SWD } else { ENTER_MODE_JTAG };
        vec![CMD_DEBUG, DEBUG_ENTER_MODE, param]
    }
}

pub struct ExitDebugMode;
impl Command for ExitDebugMode {
    fn encode(&self) -> Vec<u8> {
        vec![CMD_DEBUG, DEBUG_EXIT_MODE]
    }
}

pub struct ReadCoreId;
impl Command for ReadCoreId {
    fn encode(&self) -> Vec<u8> {
        vec![CMD_DEBUG, DEBUG_READCOREID]
    }
}

pub struct GetStatus;
impl Command for GetStatus {
    fn encode(&self) -> Vec<u8> {
        vec![CMD_DEBUG, DEBUG_GETSTATUS]
    }
}

pub struct Halt;
impl Command for Halt {
    fn encode(&self) -> Vec<u8> {
        vec![CMD_DEBUG, DEBUG_FORCEDEBUG]
    }
}

pub struct Reset;
impl Command for Reset {
    fn encode(&self) -> Vec<u8> {
        vec![CMD_DEBUG, DEBUG_RESETSYS]
    }
}

pub struct Run;
impl Command for Run {
    fn encode(&self) -> Vec<u8> {
        vec![CMD_DEBUG, DEBUG_RUNCORE]
    }
}

pub struct Step;
impl Command for Step {
    fn encode(&self) -> Vec<u8> {
        vec![CMD_DEBUG, DEBUG_STEPCORE]
    }
}

pub struct ReadAllRegs;
impl Command for ReadAllRegs {
    fn encode(&self) -> Vec<u8> {
        vec![CMD_DEBUG, DEBUG_READALLREGS]
    }
}

pub struct ReadOneReg {
    pub index: u8,
}
impl Command for ReadOneReg {
    fn encode(&self) -> Vec<u8> {
        vec![CMD_DEBUG, DEBUG_READREG, self.index]
    }
}

pub struct WriteReg {
    pub index: u8,
    pub value: u32,
}
impl Command for WriteReg {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![CMD_DEBUG, DEBUG_WRITEREG, self.index];
        buf.extend_from_slice(&self.value.to_le_bytes());
        buf
    }
}

/// `addr` must be 4-aligned (enforced by the caller masking it); `len` is
/// rounded up to a multiple of 4 by the caller before encoding.
pub struct ReadMem32 {
    pub addr: u32,
    pub len: u16,
}
impl Command for ReadMem32 {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![CMD_DEBUG, DEBUG_READMEM_32BIT];
        buf.extend_from_slice(&self.addr.to_le_bytes());
        buf.extend_from_slice(&self.len.to_le_bytes());
        buf.extend_from_slice(&[0, 0]); // pad the frame to 10 bytes
        buf
    }
}

pub struct WriteMem32 {
    pub addr: u32,
    pub len: u16,
}
impl Command for WriteMem32 {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![CMD_DEBUG, DEBUG_WRITEMEM_32BIT];
        buf.extend_from_slice(&self.addr.to_le_bytes());
        buf.extend_from_slice(&self.len.to_le_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf
    }
}

/// `len` must be at most 64 bytes.
pub struct WriteMem8 {
    pub addr: u32,
    pub len: u16,
}
impl Command for WriteMem8 {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![CMD_DEBUG, DEBUG_WRITEMEM_8BIT];
        buf.extend_from_slice(&self.addr.to_le_bytes());
        buf.extend_from_slice(&self.len.to_le_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryInto;

    use assert_hex::assert_eq_hex;
    use hex_literal::hex;

    #[test]
    fn it_should_encode_get_version() {
        assert_eq_hex!(GetVersion.encode(), vec![0xF1]);
    }

    #[test]
    fn it_should_encode_dfu_exit() {
        assert_eq_hex!(DfuExit.encode(), vec![0xF3, 0x07]);
    }

    #[test]
    fn it_should_encode_enter_swd() {
        assert_eq_hex!(
            EnterDebugMode { swd: true }.encode(),
            vec![0xF2, 0x20, 0xA3]
        );
    }

    #[test]
    fn it_should_decode_version_response() {
        // vid 0x0483, pid 0x3748
        let buf = hex!("10 40 83 04 48 37");
        let (_version, vid, pid) = decode_version(&buf);
        assert_eq_hex!(vid, 0x0483);
        assert_eq_hex!(pid, 0x3748);
    }

    #[test]
    fn it_should_encode_read_mem32_with_le_address_and_length() {
        let cmd = ReadMem32 {
            addr: 0x0800_0400,
            len: 1024,
        };
        let buf = cmd.encode();
        assert_eq!(buf.len(), 10);
        assert_eq_hex!(buf[0], 0xF2);
        assert_eq_hex!(buf[1], 0x07);
        assert_eq!(u32::from_le_bytes(buf[2..6].try_into().unwrap()), 0x0800_0400);
        assert_eq!(u16::from_le_bytes(buf[6..8].try_into().unwrap()), 1024);
    }

    #[test]
    fn it_should_encode_write_reg_with_full_32bit_value() {
        let cmd = WriteReg { index: 4, value: 0xdead_beef };
        let buf = cmd.encode();
        assert_eq!(buf[2], 4);
        assert_eq!(u32::from_le_bytes(buf[3..7].try_into().unwrap()), 0xdead_beef);
    }

    #[test]
    fn status_byte_decoding_matches_the_core_status_table() {
        assert_eq!(CoreStatus::from_wire(0x80), Some(CoreStatus::Running));
        assert_eq!(CoreStatus::from_wire(0x81), Some(CoreStatus::Halted));
        assert_eq!(CoreStatus::from_wire(0x00), None);
    }
}
