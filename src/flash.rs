//! Flash erase and programming.
//!
//! The dongle cannot drive the STM32 flash controller's bus cycles on its
//! own; erase is a sequence of plain memory writes to the flash controller's
//! register window, and programming stages a [`crate::loader`] stub into
//! target SRAM and runs it. [`FlashProgrammer`] borrows a [`Session`]
//! exclusively for the duration of one erase/write/verify operation.

use std::convert::TryInto;

use log::{debug, warn};

use crate::chip::ChipFamily;
use crate::error::FlashWriteError;
use crate::loader::{self, LoaderStub};
use crate::session::{CoreState, Session};
use crate::{Error, MASS_ERASE_SENTINEL};

const FLASH_KEYR: u32 = 0x4002_2004;
const FLASH_SR: u32 = 0x4002_200C;
const FLASH_CR: u32 = 0x4002_2010;
const FLASH_AR: u32 = 0x4002_2014;

const F4_BASE: u32 = 0x4002_3C00;
const F4_KEYR: u32 = F4_BASE + 0x04;
const F4_SR: u32 = F4_BASE + 0x0C;
const F4_CR: u32 = F4_BASE + 0x10;

const L1_BASE: u32 = 0x4002_3C00;
const L1_PECR: u32 = L1_BASE + 0x04;
const L1_PEKEYR: u32 = L1_BASE + 0x0C;
const L1_PRGKEYR: u32 = L1_BASE + 0x10;
const L1_SR: u32 = L1_BASE + 0x18;
const L1_OBR: u32 = L1_BASE + 0x1C;

const FLASH_KEY1: u32 = 0x4567_0123;
const FLASH_KEY2: u32 = 0xCDEF_89AB;
const PEKEY1: u32 = 0x89AB_CDEF;
const PEKEY2: u32 = 0x0203_0405;
const PRGKEY1: u32 = 0x8C9D_AEBF;
const PRGKEY2: u32 = 0x1314_1516;

const SR_BSY: u32 = 0x01;
const SR_PGERR: u32 = 0x04;
const SR_WRPRTERR: u32 = 0x10;
const SR_EOP: u32 = 0x20;
const F4_SR_BUSY: u32 = 0x0001_0000;
/// F4-class `FLASH_CR` STRT bit (bit 16). Distinct from the F1-class
/// `CR_STRT` (bit 6) — the two controllers place the erase-start bit at
/// different offsets.
const F4_CR_STRT: u32 = 0x0001_0000;

const CR_PER: u32 = 0x02;
const CR_MER: u32 = 0x04;
const CR_STRT: u32 = 0x40;
const CR_LOCK: u32 = 0x80;

/// First address of the second flash bank on F1 high-density parts. The
/// erase/program FPEC at this base mirrors the one at `0x4002_2000` but
/// drives the bank covering addresses at or above `0x0808_0000`.
const FLASH_CTRL_BASE: u32 = 0x4002_2000;
const FLASH_CTRL_BASE_HD_BANK2: u32 = 0x4002_2040;

const SRAM_BASE: u32 = 0x2000_0000;
const WRITE_CHUNK_SIZE: usize = 2048;
const ERASE_POLL_ITERS: u32 = 1000;
const RUN_POLL_ITERS: u32 = 200;
const VERIFY_CHUNK_SIZE: usize = 128 * 1024;

/// Owns a `Session` for the duration of an erase/program/verify operation.
pub struct FlashProgrammer<'a> {
    session: &'a mut Session,
}

impl<'a> FlashProgrammer<'a> {
    pub fn new(session: &'a mut Session) -> Self {
        FlashProgrammer { session }
    }

    /// Erases one page at `addr`, or every user page when `addr` is
    /// [`MASS_ERASE_SENTINEL`], dispatching by chip family.
    pub fn erase_page(&mut self, addr: u32) -> Result<(), Error> {
        match self.session.chip().family {
            ChipFamily::F4 => self.erase_f4(addr),
            ChipFamily::L1 => self.erase_l1(addr),
            ChipFamily::F1 | ChipFamily::Generic => self.erase_f1(addr),
        }
    }

    /// Mass-erases all user flash, retrying once if the first attempt
    /// reports failure.
    pub fn mass_erase(&mut self) -> Result<(), Error> {
        match self.erase_page(MASS_ERASE_SENTINEL) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("mass erase failed ({}), retrying once", e);
                self.erase_page(MASS_ERASE_SENTINEL)
            }
        }
    }

    fn erase_f1(&mut self, addr: u32) -> Result<(), Error> {
        self.session.write_mem32(FLASH_KEYR, &FLASH_KEY1.to_le_bytes())?;
        self.session.write_mem32(FLASH_KEYR, &FLASH_KEY2.to_le_bytes())?;
        self.session.write_mem32(FLASH_SR, &0x34u32.to_le_bytes())?;

        if addr == MASS_ERASE_SENTINEL {
            debug!("F1 mass erase");
            self.session.write_mem32(FLASH_CR, &CR_MER.to_le_bytes())?;
            self.session.write_mem32(FLASH_CR, &(CR_STRT | CR_MER).to_le_bytes())?;
        } else {
            debug!("F1 page erase at {:#010x}", addr);
            self.session.write_mem32(FLASH_AR, &addr.to_le_bytes())?;
            self.session.write_mem32(FLASH_CR, &CR_PER.to_le_bytes())?;
            self.session.write_mem32(FLASH_CR, &(CR_STRT | CR_PER).to_le_bytes())?;
        }

        self.poll_erase_busy(FLASH_SR, SR_BSY)
    }

    fn erase_f4(&mut self, addr: u32) -> Result<(), Error> {
        self.session.write_mem32(F4_KEYR, &FLASH_KEY1.to_le_bytes())?;
        self.session.write_mem32(F4_KEYR, &FLASH_KEY2.to_le_bytes())?;
        self.session.write_mem32(F4_SR, &0x34u32.to_le_bytes())?;

        if addr == MASS_ERASE_SENTINEL {
            debug!("F4 mass erase");
            self.session.write_mem32(F4_CR, &CR_MER.to_le_bytes())?;
            self.session.write_mem32(F4_CR, &(F4_CR_STRT | CR_MER).to_le_bytes())?;
        } else {
            let sector = f4_sector_for(addr);
            debug!("F4 sector erase: addr {:#010x} -> sector {}", addr, sector);
            let armed = 0x0020_2u32 | (sector << 3);
            let started = 0x1020_2u32 | (sector << 3);
            self.session.write_mem32(F4_CR, &armed.to_le_bytes())?;
            self.session.write_mem32(F4_CR, &started.to_le_bytes())?;
        }

        self.poll_erase_busy(F4_SR, F4_SR_BUSY)
    }

    fn erase_l1(&mut self, addr: u32) -> Result<(), Error> {
        self.session.write_mem32(L1_PEKEYR, &PEKEY1.to_le_bytes())?;
        self.session.write_mem32(L1_PEKEYR, &PEKEY2.to_le_bytes())?;
        self.session.write_mem32(L1_PRGKEYR, &PRGKEY1.to_le_bytes())?;
        self.session.write_mem32(L1_PRGKEYR, &PRGKEY2.to_le_bytes())?;

        if addr == MASS_ERASE_SENTINEL {
            debug!("L1 mass erase (emulated via OBR toggle)");
            let obr = self.read_u32(L1_OBR)?;
            self.session.write_mem32(L1_OBR, &(obr ^ 1).to_le_bytes())?;
            self.session.write_mem32(L1_OBR, &obr.to_le_bytes())?;
        } else {
            debug!("L1 page erase at {:#010x}", addr);
            const PECR_PROG: u32 = 0x0000_0008;
            const PECR_ERASE: u32 = 0x0000_0200;
            self.session.write_mem32(L1_PECR, &(PECR_PROG | PECR_ERASE).to_le_bytes())?;
            self.session.write_mem32(addr, &0u32.to_le_bytes())?;
        }

        self.poll_erase_busy(L1_SR, SR_BSY)
    }

    fn poll_erase_busy(&mut self, sr_addr: u32, busy_bit: u32) -> Result<(), Error> {
        for _ in 0..ERASE_POLL_ITERS {
            let sr = self.read_u32(sr_addr)?;
            if sr & busy_bit == 0 {
                return if sr & SR_EOP != 0 {
                    Ok(())
                } else {
                    Err(Error::FlashEraseTimeout)
                };
            }
        }
        Err(Error::FlashEraseTimeout)
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32, Error> {
        let buf = self.session.read(addr, 4)?;
        Ok(u32::from_le_bytes(buf.try_into().unwrap()))
    }

    /// Programs `data` at `addr` via the chunked loader-stub loop.
    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        self.unlock_and_clear_status()?;

        let chip = self.session.chip();
        let family = chip.family;
        let flash_size = chip.flash_size;
        let stub = loader::stub_for_family(family);

        let mut cursor = addr;
        let mut offset = 0usize;
        let loop_result: Result<(), Error> = (|| {
            while offset < data.len() {
                let consumed = (data.len() - offset).min(WRITE_CHUNK_SIZE);
                let mut chunk = data[offset..offset + consumed].to_vec();
                if chunk.len() % 2 != 0 {
                    // Odd-size tail: pad up to a whole halfword with the erased value.
                    chunk.push(0xFF);
                }

                self.write_chunk_via_loader(stub, cursor, &chunk, flash_size, family)?;

                cursor += chunk.len() as u32;
                offset += consumed;
            }
            Ok(())
        })();

        let status_result = loop_result.and_then(|()| self.check_write_status(family));
        self.relock(family);
        status_result
    }

    fn write_chunk_via_loader(
        &mut self,
        stub: &LoaderStub,
        target_addr: u32,
        chunk: &[u8],
        flash_size: u32,
        family: ChipFamily,
    ) -> Result<(), Error> {
        // The loader stub pokes the flash controller register window
        // directly, so its base must match the family the stub itself was
        // written for (L1 reuses the F1 stub's PG-bit convention with the
        // L1 controller base).
        let ctrl_base = match family {
            ChipFamily::F4 => F4_BASE,
            ChipFamily::L1 => L1_BASE,
            ChipFamily::F1 | ChipFamily::Generic => {
                if flash_size > 256 * 1024 && target_addr >= 0x0808_0000 {
                    FLASH_CTRL_BASE_HD_BANK2
                } else {
                    FLASH_CTRL_BASE
                }
            }
        };

        let stub_len = stub.len() as u32;
        let source_addr = SRAM_BASE + stub_len + 16; // right after the 4-word parameter tail
        let halfword_count = (chunk.len() / 2) as u32;

        let mut buf = Vec::with_capacity(stub.len() + 16 + chunk.len());
        buf.extend_from_slice(stub.code);
        buf.extend_from_slice(&ctrl_base.to_le_bytes());
        buf.extend_from_slice(&source_addr.to_le_bytes());
        buf.extend_from_slice(&target_addr.to_le_bytes());
        buf.extend_from_slice(&halfword_count.to_le_bytes());
        buf.extend_from_slice(chunk);
        while buf.len() % 4 != 0 {
            buf.push(0);
        }

        self.session.write_mem32(SRAM_BASE, &buf)?;
        self.session.write_reg(15, SRAM_BASE)?;
        self.session.run()?;

        for _ in 0..RUN_POLL_ITERS {
            if self.session.status()? == CoreState::Halted {
                return Ok(());
            }
        }

        Err(Error::LoaderHangTimeout)
    }

    fn check_write_status(&mut self, family: ChipFamily) -> Result<(), Error> {
        let sr_addr = match family {
            ChipFamily::F4 => F4_SR,
            ChipFamily::L1 => L1_SR,
            ChipFamily::F1 | ChipFamily::Generic => FLASH_SR,
        };
        let sr = self.read_u32(sr_addr)?;

        if sr & SR_PGERR != 0 {
            return Err(Error::FlashWrite(FlashWriteError::NotErased));
        }
        if sr & SR_WRPRTERR != 0 {
            return Err(Error::FlashWrite(FlashWriteError::WriteProtected));
        }
        Ok(())
    }

    fn unlock_and_clear_status(&mut self) -> Result<(), Error> {
        match self.session.chip().family {
            ChipFamily::F4 => {
                self.session.write_mem32(F4_KEYR, &FLASH_KEY1.to_le_bytes())?;
                self.session.write_mem32(F4_KEYR, &FLASH_KEY2.to_le_bytes())?;
                self.session.write_mem32(F4_SR, &0x34u32.to_le_bytes())?;
            }
            ChipFamily::L1 => {
                self.session.write_mem32(L1_PEKEYR, &PEKEY1.to_le_bytes())?;
                self.session.write_mem32(L1_PEKEYR, &PEKEY2.to_le_bytes())?;
                self.session.write_mem32(L1_PRGKEYR, &PRGKEY1.to_le_bytes())?;
                self.session.write_mem32(L1_PRGKEYR, &PRGKEY2.to_le_bytes())?;
            }
            ChipFamily::F1 | ChipFamily::Generic => {
                self.session.write_mem32(FLASH_KEYR, &FLASH_KEY1.to_le_bytes())?;
                self.session.write_mem32(FLASH_KEYR, &FLASH_KEY2.to_le_bytes())?;
                self.session.write_mem32(FLASH_SR, &0x34u32.to_le_bytes())?;
            }
        }
        Ok(())
    }

    fn relock(&mut self, family: ChipFamily) {
        let cr_addr = match family {
            ChipFamily::F4 => F4_CR,
            ChipFamily::L1 => L1_PECR,
            ChipFamily::F1 | ChipFamily::Generic => FLASH_CR,
        };
        if let Err(e) = self.session.write_mem32(cr_addr, &CR_LOCK.to_le_bytes()) {
            warn!("failed to re-lock flash after programming: {}", e);
        }
    }

    /// Streams `data` from flash starting at `addr` in chunks of at most
    /// [`VERIFY_CHUNK_SIZE`] bytes, aborting on the first mismatch.
    pub fn verify(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        let mut cursor = addr;
        let mut offset = 0usize;

        while offset < data.len() {
            let len = (data.len() - offset).min(VERIFY_CHUNK_SIZE);
            let actual = self.session.read(cursor, len)?;

            for (i, (&expected, &got)) in data[offset..offset + len].iter().zip(actual.iter()).enumerate() {
                if expected != got {
                    return Err(Error::VerifyMismatch {
                        offset: offset + i,
                        expected,
                        actual: got,
                    });
                }
            }

            cursor += len as u32;
            offset += len;
        }

        Ok(())
    }
}

/// The inverse of [`f4_sector_for`]: the `(offset, size)` of a sector
/// relative to `flash_base`. Used by [`crate::transport::mock`] to erase the
/// correct region when simulating an F4-class part.
pub(crate) fn f4_sector_bounds(sector: u32) -> (u32, u32) {
    const KB: u32 = 1024;
    match sector {
        0 => (0, 16 * KB),
        1 => (16 * KB, 16 * KB),
        2 => (32 * KB, 16 * KB),
        3 => (48 * KB, 16 * KB),
        4 => (64 * KB, 64 * KB),
        n => (128 * KB + (n - 5) * 128 * KB, 128 * KB),
    }
}

/// Maps a flash address to its containing sector on an STM32F405/407-class
/// part: four 16 KiB sectors, one 64 KiB sector, then uniform 128 KiB
/// sectors.
fn f4_sector_for(addr: u32) -> u32 {
    let offset = addr.saturating_sub(0x0800_0000);
    match offset {
        0x0000_0000..=0x0000_3FFF => 0,
        0x0000_4000..=0x0000_7FFF => 1,
        0x0000_8000..=0x0000_BFFF => 2,
        0x0000_C000..=0x0000_FFFF => 3,
        0x0001_0000..=0x0001_FFFF => 4,
        0x0002_0000..=0x0003_FFFF => 5,
        0x0004_0000..=0x0005_FFFF => 6,
        0x0006_0000..=0x0007_FFFF => 7,
        0x0008_0000..=0x0009_FFFF => 8,
        0x000A_0000..=0x000B_FFFF => 9,
        0x000C_0000..=0x000D_FFFF => 10,
        _ => 11,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn attached_session() -> Session {
        let transport = MockTransport::stm32f100();
        let mut session = Session::attach(Box::new(transport)).unwrap();
        session.mode_kick().unwrap();
        session.identify_chip().unwrap();
        session
    }

    #[test]
    fn erase_page_clears_the_target_page_to_erased_bytes() {
        let mut session = attached_session();
        let addr = session.chip().flash_base + 0x400;
        session.write_mem32(addr, &[0, 0, 0, 0]).unwrap();

        {
            let mut flash = FlashProgrammer::new(&mut session);
            flash.erase_page(addr).unwrap();
        }

        assert_eq!(session.read(addr, 4).unwrap(), vec![0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn mass_erase_clears_the_whole_flash_region() {
        let mut session = attached_session();
        let flash_base = session.chip().flash_base;
        session.write_mem32(flash_base, &[0, 0, 0, 0]).unwrap();

        {
            let mut flash = FlashProgrammer::new(&mut session);
            flash.mass_erase().unwrap();
        }

        assert_eq!(session.read(flash_base, 4).unwrap(), vec![0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn write_then_verify_round_trips_through_the_loader_stub() {
        let mut session = attached_session();
        let addr = session.chip().flash_base + 0x800;
        let payload: Vec<u8> = (0..64u8).collect();

        let mut flash = FlashProgrammer::new(&mut session);
        flash.erase_page(addr).unwrap();
        flash.write(addr, &payload).unwrap();
        flash.verify(addr, &payload).unwrap();
    }

    #[test]
    fn write_reports_not_erased_when_target_was_not_cleared() {
        let mut session = attached_session();
        let addr = session.chip().flash_base + 0xC00;
        // Poke a non-erased byte directly, bypassing erase_page entirely.
        session.write_mem32(addr, &[0x00, 0x00, 0x00, 0x00]).unwrap();

        let mut flash = FlashProgrammer::new(&mut session);
        let err = flash.write(addr, &[0xAA, 0xBB, 0xCC, 0xDD]).unwrap_err();
        assert!(matches!(err, Error::FlashWrite(FlashWriteError::NotErased)));
    }

    #[test]
    fn verify_reports_the_first_mismatching_offset() {
        let mut session = attached_session();
        let addr = session.chip().flash_base + 0x1000;
        let payload = vec![0x11u8, 0x22, 0x33, 0x44];

        let mut flash = FlashProgrammer::new(&mut session);
        flash.erase_page(addr).unwrap();
        flash.write(addr, &payload).unwrap();

        let err = flash.verify(addr, &[0x11, 0x22, 0xFF, 0x44]).unwrap_err();
        match err {
            Error::VerifyMismatch { offset, expected, actual } => {
                assert_eq!(offset, 2);
                assert_eq!(expected, 0xFF);
                assert_eq!(actual, 0x33);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn f4_sector_lookup_matches_the_non_uniform_sector_map() {
        assert_eq!(f4_sector_for(0x0800_0000), 0);
        assert_eq!(f4_sector_for(0x0800_3FFF), 0);
        assert_eq!(f4_sector_for(0x0800_4000), 1);
        assert_eq!(f4_sector_for(0x0801_0000), 4);
        assert_eq!(f4_sector_for(0x0802_0000), 5);
        assert_eq!(f4_sector_for(0x080F_FFFF), 11);
    }

    fn attached_f4_session() -> Session {
        let transport = MockTransport::stm32f4();
        let mut session = Session::attach(Box::new(transport)).unwrap();
        session.mode_kick().unwrap();
        session.identify_chip().unwrap();
        session
    }

    #[test]
    fn f4_erase_write_verify_round_trips_through_the_sector_addressed_controller() {
        let mut session = attached_f4_session();
        assert_eq!(session.chip().family, ChipFamily::F4);

        let addr = session.chip().flash_base + 0x4000; // sector 1
        let payload: Vec<u8> = (0..128u8).collect();

        let mut flash = FlashProgrammer::new(&mut session);
        flash.erase_page(addr).unwrap();
        flash.write(addr, &payload).unwrap();
        flash.verify(addr, &payload).unwrap();
    }

    #[test]
    fn f4_mass_erase_clears_the_whole_flash_region() {
        let mut session = attached_f4_session();
        let flash_base = session.chip().flash_base;
        session.write_mem32(flash_base, &[0, 0, 0, 0]).unwrap();

        {
            let mut flash = FlashProgrammer::new(&mut session);
            flash.mass_erase().unwrap();
        }

        assert_eq!(session.read(flash_base, 4).unwrap(), vec![0xFF, 0xFF, 0xFF, 0xFF]);
    }
}
