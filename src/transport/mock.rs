//! An in-memory STLink + target simulator for unit and integration tests.
//!
//! This is not a byte-for-byte USB simulator; it decodes the same command
//! frames [`crate::command`] produces and answers them the way a real
//! STLink + STM32 target would (F1-class or F4-class, picked at
//! construction), including running the flash loader stub staged into
//! simulated SRAM (instead of actually executing Thumb-2 code).
//! It exists so the flash programming pipeline can be exercised end to end
//! without hardware.

use std::collections::HashMap;
use std::convert::TryInto;

use crate::chip::{ChipDescriptor, ChipFamily, CHIP_TABLE, DBGMCU_IDCODE_ADDR};
use crate::command::{self, CoreStatus};
use crate::flash::f4_sector_bounds;
use crate::loader::{F1_STUB, F4_STUB};
use crate::regs::REGISTER_COUNT;
use crate::{ST_VENDOR_ID, STLINK_V2_PRODUCT_ID};

use super::{TransportError, UsbTransport};

const FLASH_KEYR: u32 = 0x4002_2004;
const FLASH_SR: u32 = 0x4002_200C;
const FLASH_CR: u32 = 0x4002_2010;
const FLASH_AR: u32 = 0x4002_2014;

const F4_KEYR: u32 = 0x4002_3C04;
const F4_SR: u32 = 0x4002_3C0C;
const F4_CR: u32 = 0x4002_3C10;

const FLASH_KEY1: u32 = 0x4567_0123;
const FLASH_KEY2: u32 = 0xCDEF_89AB;

const SR_BSY: u32 = 0x01;
const SR_PGERR: u32 = 0x04;
const SR_WRPRTERR: u32 = 0x10;
const SR_EOP: u32 = 0x20;
const F4_SR_BUSY: u32 = 0x0001_0000;
const F4_CR_STRT: u32 = 0x0001_0000;

const CR_PER: u32 = 0x02;
const CR_MER: u32 = 0x04;
const CR_STRT: u32 = 0x40;
const CR_LOCK: u32 = 0x80;

pub struct MockTransport {
    chip: &'static ChipDescriptor,
    mode: u16,
    core_running: bool,
    regs: [u32; REGISTER_COUNT],
    mem: HashMap<u32, u8>,

    flash_unlock_stage: u8,
    flash_unlocked: bool,
    flash_sr: u32,
    flash_cr: u32,
    flash_ar: u32,
    erase_countdown: u32,
    pending_erase: Option<PendingErase>,

    pending_stub_base: Option<u32>,
    pending_response: Vec<u8>,
}

#[derive(Clone, Copy)]
enum PendingErase {
    Page(u32),
    Sector(u32),
    Mass,
}

impl MockTransport {
    fn new_with_idcode(idcode: u32, mode: u16) -> Self {
        MockTransport {
            chip: &CHIP_TABLE[crate::chip::lookup_by_idcode(idcode)],
            mode,
            core_running: true,
            regs: [0; REGISTER_COUNT],
            mem: HashMap::new(),
            flash_unlock_stage: 0,
            flash_unlocked: false,
            flash_sr: 0,
            flash_cr: 0,
            flash_ar: 0,
            erase_countdown: 0,
            pending_erase: None,
            pending_stub_base: None,
            pending_response: Vec::new(),
        }
    }

    /// A mock wired up to look like an STM32F100 VLDiscovery board,
    /// starting in DFU mode so `mode_kick` exercises the full retry state
    /// machine.
    pub fn stm32f100() -> Self {
        Self::new_with_idcode(0x1001_6420, 0 /* Dfu */)
    }

    /// A mock wired up to look like an STM32F405/407, for exercising the
    /// F4-class erase/program path (sector-addressed `FLASH_CR`, no `FLASH_AR`).
    pub fn stm32f4() -> Self {
        Self::new_with_idcode(0x1001_0413, 0 /* Dfu */)
    }

    fn default_byte(&self, addr: u32) -> u8 {
        let c = self.chip;
        let in_flash = addr >= c.flash_base && addr < c.flash_base + c.flash_size;
        let in_sys_flash = addr >= c.sys_flash_base && addr < c.sys_flash_base + c.sys_flash_size;
        if in_flash || in_sys_flash {
            0xFF
        } else {
            0x00
        }
    }

    fn read_byte(&self, addr: u32) -> u8 {
        self.mem.get(&addr).copied().unwrap_or_else(|| self.default_byte(addr))
    }

    fn write_byte(&mut self, addr: u32, value: u8) {
        self.mem.insert(addr, value);
    }

    /// Test-only introspection: reads flash/SRAM directly, bypassing the
    /// protocol, for assertions that don't want to depend on `Session`.
    pub fn peek(&self, addr: u32, len: usize) -> Vec<u8> {
        (0..len as u32).map(|i| self.read_byte(addr + i)).collect()
    }

    /// `(KEYR, SR, CR)` addresses for the current chip's family. F1 and F4
    /// share the same mock unlock-key handling; only the CR encoding and
    /// the presence of an `AR` register differ.
    fn flash_reg_addrs(&self) -> (u32, u32, u32) {
        match self.chip.family {
            ChipFamily::F4 => (F4_KEYR, F4_SR, F4_CR),
            ChipFamily::F1 | ChipFamily::L1 | ChipFamily::Generic => (FLASH_KEYR, FLASH_SR, FLASH_CR),
        }
    }

    fn is_f4(&self) -> bool {
        matches!(self.chip.family, ChipFamily::F4)
    }

    fn handle_flash_reg_write(&mut self, addr: u32, value: u32) {
        let (keyr, sr, cr) = self.flash_reg_addrs();

        if addr == keyr {
            if self.flash_unlock_stage == 0 && value == FLASH_KEY1 {
                self.flash_unlock_stage = 1;
            } else if self.flash_unlock_stage == 1 && value == FLASH_KEY2 {
                self.flash_unlocked = true;
                self.flash_unlock_stage = 0;
            } else {
                self.flash_unlock_stage = 0;
            }
        } else if addr == sr {
            // write-1-to-clear
            self.flash_sr &= !value;
        } else if !self.is_f4() && addr == FLASH_AR {
            self.flash_ar = value;
        } else if addr == cr {
            self.flash_cr = value;
            if !self.flash_unlocked {
                return;
            }

            if self.is_f4() {
                if value & F4_CR_STRT != 0 {
                    if value & CR_MER != 0 {
                        self.pending_erase = Some(PendingErase::Mass);
                    } else {
                        let sector = (value >> 3) & 0xF;
                        self.pending_erase = Some(PendingErase::Sector(sector));
                    }
                    self.erase_countdown = 2;
                } else if value == CR_LOCK {
                    self.flash_unlocked = false;
                }
            } else if value & CR_STRT != 0 {
                if value & CR_MER != 0 {
                    self.pending_erase = Some(PendingErase::Mass);
                } else if value & CR_PER != 0 {
                    self.pending_erase = Some(PendingErase::Page(self.flash_ar));
                }
                self.erase_countdown = 2;
            } else if value == CR_LOCK {
                self.flash_unlocked = false;
            }
        }
    }

    fn handle_flash_reg_read(&mut self, addr: u32) -> Option<u32> {
        let (_, sr, _) = self.flash_reg_addrs();
        if addr != sr {
            return None;
        }

        if self.erase_countdown > 0 {
            self.erase_countdown -= 1;
            if self.erase_countdown == 0 {
                if let Some(op) = self.pending_erase.take() {
                    self.perform_erase(op);
                }
                self.flash_sr = SR_EOP;
            } else {
                self.flash_sr |= if self.is_f4() { F4_SR_BUSY } else { SR_BSY };
            }
        }

        Some(self.flash_sr)
    }

    fn perform_erase(&mut self, op: PendingErase) {
        let c = self.chip;
        match op {
            PendingErase::Mass => {
                for addr in c.flash_base..c.flash_base + c.flash_size {
                    self.mem.insert(addr, 0xFF);
                }
            }
            PendingErase::Page(addr) => {
                let page = addr - (addr % c.flash_page_size);
                for a in page..page + c.flash_page_size {
                    self.mem.insert(a, 0xFF);
                }
            }
            PendingErase::Sector(sector) => {
                let (offset, size) = f4_sector_bounds(sector);
                let base = c.flash_base + offset;
                for a in base..base + size {
                    self.mem.insert(a, 0xFF);
                }
            }
        }
    }

    fn run_pending_stub(&mut self) {
        let Some(base) = self.pending_stub_base.take() else {
            self.core_running = false;
            return;
        };

        let stub_len = if self.mem_matches(base, F4_STUB.code) {
            F4_STUB.code.len()
        } else {
            F1_STUB.code.len()
        };

        let param_base = base + stub_len as u32;
        let _flash_ctrl_base = self.read_u32(param_base);
        let source_addr = self.read_u32(param_base + 4);
        let target_addr = self.read_u32(param_base + 8);
        let halfword_count = self.read_u32(param_base + 12);

        for i in 0..halfword_count {
            let src = source_addr + i * 2;
            let dst = target_addr + i * 2;

            let lo = self.read_byte(dst);
            let hi = self.read_byte(dst + 1);
            if lo != 0xFF || hi != 0xFF {
                self.flash_sr |= SR_PGERR;
            }

            let v0 = self.read_byte(src);
            let v1 = self.read_byte(src + 1);
            self.write_byte(dst, v0);
            self.write_byte(dst + 1, v1);
        }

        self.flash_sr |= SR_EOP;
        self.core_running = false;
    }

    fn mem_matches(&self, base: u32, pattern: &[u8]) -> bool {
        pattern.iter().enumerate().all(|(i, b)| self.read_byte(base + i as u32) == *b)
    }

    fn read_u32(&self, addr: u32) -> u32 {
        u32::from_le_bytes([
            self.read_byte(addr),
            self.read_byte(addr + 1),
            self.read_byte(addr + 2),
            self.read_byte(addr + 3),
        ])
    }
}

impl UsbTransport for MockTransport {
    fn write_command(&mut self, cmd: &[u8], payload: Option<&[u8]>) -> Result<(), TransportError> {
        let opcode = cmd[0];

        self.pending_response = match opcode {
            command::CMD_GET_VERSION => {
                let version: u16 = (2u16 << 12) | (24u16 << 6) | 0;
                let mut buf = version.to_be_bytes().to_vec();
                buf.extend_from_slice(&ST_VENDOR_ID.to_le_bytes());
                buf.extend_from_slice(&STLINK_V2_PRODUCT_ID.to_le_bytes());
                buf
            }
            command::CMD_DFU => Vec::new(),
            command::CMD_GET_CURRENT_MODE => self.mode.to_le_bytes().to_vec(),
            command::CMD_DEBUG => match cmd[1] {
                command::DEBUG_ENTER_MODE => {
                    self.mode = 2; // Debug
                    vec![self.status_byte(), 0]
                }
                command::DEBUG_EXIT_MODE => {
                    self.mode = 1; // MassStorage
                    Vec::new()
                }
                command::DEBUG_READCOREID => self.chip.core_id.to_le_bytes().to_vec(),
                command::DEBUG_GETSTATUS => vec![self.status_byte(), 0],
                command::DEBUG_FORCEDEBUG => {
                    self.core_running = false;
                    vec![self.status_byte(), 0]
                }
                command::DEBUG_RESETSYS => {
                    self.core_running = false;
                    vec![self.status_byte(), 0]
                }
                command::DEBUG_RUNCORE => {
                    self.run_pending_stub();
                    vec![self.status_byte(), 0]
                }
                command::DEBUG_STEPCORE => {
                    vec![self.status_byte(), 0]
                }
                command::DEBUG_READALLREGS => {
                    let mut buf = Vec::with_capacity(REGISTER_COUNT * 4);
                    for r in &self.regs {
                        buf.extend_from_slice(&r.to_le_bytes());
                    }
                    buf
                }
                command::DEBUG_READREG => {
                    let idx = cmd[2] as usize;
                    self.regs[idx].to_le_bytes().to_vec()
                }
                command::DEBUG_WRITEREG => {
                    let idx = cmd[2] as usize;
                    let value = u32::from_le_bytes(cmd[3..7].try_into().unwrap());
                    self.regs[idx] = value;
                    vec![self.status_byte(), 0]
                }
                command::DEBUG_READMEM_32BIT => {
                    let addr = u32::from_le_bytes(cmd[2..6].try_into().unwrap());
                    let len = u16::from_le_bytes(cmd[6..8].try_into().unwrap()) as usize;

                    if addr == DBGMCU_IDCODE_ADDR {
                        let mut buf = self.chip.idcode.to_le_bytes().to_vec();
                        buf.resize(len, 0);
                        buf
                    } else if let Some(sr) = self.handle_flash_reg_read(addr) {
                        let mut buf = sr.to_le_bytes().to_vec();
                        buf.resize(len.max(4), 0);
                        buf.truncate(len);
                        buf
                    } else {
                        (0..len as u32).map(|i| self.read_byte(addr + i)).collect()
                    }
                }
                command::DEBUG_WRITEMEM_32BIT | command::DEBUG_WRITEMEM_8BIT => {
                    let addr = u32::from_le_bytes(cmd[2..6].try_into().unwrap());
                    let payload = payload.expect("write commands must carry a payload");

                    let (keyr, sr, cr) = self.flash_reg_addrs();
                    if addr == keyr || addr == sr || addr == cr || (!self.is_f4() && addr == FLASH_AR) {
                        let value = u32::from_le_bytes(payload[0..4].try_into().unwrap());
                        self.handle_flash_reg_write(addr, value);
                    } else {
                        for (i, byte) in payload.iter().enumerate() {
                            self.write_byte(addr + i as u32, *byte);
                        }
                        if self.mem_matches(addr, F1_STUB.code) || self.mem_matches(addr, F4_STUB.code) {
                            self.pending_stub_base = Some(addr);
                        }
                    }
                    Vec::new()
                }
                _ => panic!("mock transport: unhandled debug sub-opcode {:#x}", cmd[1]),
            },
            _ => panic!("mock transport: unhandled opcode {:#x}", opcode),
        };

        Ok(())
    }

    fn read_response(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = std::mem::take(&mut self.pending_response);
        buf.resize(len, 0);
        Ok(buf)
    }

    fn reopen(&mut self) -> Result<(), TransportError> {
        // The real dongle re-enumerates after DFU-exit; the mock just
        // reports debug mode from here on, matching a well-behaved dongle.
        self.mode = 2;
        Ok(())
    }

    fn device_path(&self) -> String {
        "mock:0".to_string()
    }
}

impl MockTransport {
    fn status_byte(&self) -> u8 {
        if self.core_running {
            CoreStatus::RUNNING_BYTE
        } else {
            CoreStatus::HALTED_BYTE
        }
    }
}
