//! The ARM core register file: 21 x 32-bit words transmitted as a single
//! 84-byte blob.

use byteorder::{ByteOrder, LittleEndian};

/// Number of 32-bit words in the register file.
pub const REGISTER_COUNT: usize = 21;
/// Size in bytes of the wire blob returned by `ReadAllRegs`.
pub const REGISTER_FILE_BYTES: usize = REGISTER_COUNT * 4;

const IDX_PC: usize = 15;
const IDX_XPSR: usize = 16;
const IDX_SP_MAIN: usize = 17;
const IDX_SP_PROCESS: usize = 18;

/// The 21-word ARM core register file: r0..r15 (r15 = PC), xPSR, main SP,
/// process SP, and the two STLink-private scratch registers `rw`/`rw2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterFile(pub [u32; REGISTER_COUNT]);

impl RegisterFile {
    pub fn new() -> Self {
        RegisterFile([0; REGISTER_COUNT])
    }

    /// Decodes the 84-byte wire blob returned by `ReadAllRegs`.
    ///
    /// Panics if `buf` is shorter than [`REGISTER_FILE_BYTES`]; callers are
    /// expected to have validated the response length against the command
    /// layer's declared response size before calling this.
    pub fn from_wire(buf: &[u8]) -> Self {
        assert!(buf.len() >= REGISTER_FILE_BYTES, "register blob too short");

        let mut regs = [0u32; REGISTER_COUNT];
        for (i, word) in regs.iter_mut().enumerate() {
            *word = LittleEndian::read_u32(&buf[i * 4..i * 4 + 4]);
        }

        RegisterFile(regs)
    }

    pub fn to_wire(&self) -> [u8; REGISTER_FILE_BYTES] {
        let mut buf = [0u8; REGISTER_FILE_BYTES];
        for (i, word) in self.0.iter().enumerate() {
            LittleEndian::write_u32(&mut buf[i * 4..i * 4 + 4], *word);
        }
        buf
    }

    pub fn get(&self, index: usize) -> u32 {
        self.0[index]
    }

    pub fn set(&mut self, index: usize, value: u32) {
        self.0[index] = value;
    }

    pub fn pc(&self) -> u32 {
        self.0[IDX_PC]
    }

    pub fn set_pc(&mut self, value: u32) {
        self.0[IDX_PC] = value;
    }

    pub fn xpsr(&self) -> u32 {
        self.0[IDX_XPSR]
    }

    pub fn sp_main(&self) -> u32 {
        self.0[IDX_SP_MAIN]
    }

    pub fn sp_process(&self) -> u32 {
        self.0[IDX_SP_PROCESS]
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_the_wire_blob() {
        let mut regs = RegisterFile::new();
        regs.set(0, 0x1111_1111);
        regs.set_pc(0x0800_0200);
        regs.0[20] = 0xdead_beef;

        let wire = regs.to_wire();
        assert_eq!(wire.len(), REGISTER_FILE_BYTES);

        let decoded = RegisterFile::from_wire(&wire);
        assert_eq!(decoded, regs);
        assert_eq!(decoded.pc(), 0x0800_0200);
    }
}
