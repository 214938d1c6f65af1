//! The static chip descriptor table.
//!
//! Lookup key is `DBGMCU_IDCODE`, read at `0xE0042000` (or `0x40015800` on
//! Cortex-M0 parts when the first address reads zero). The table is a closed
//! enumeration: adding a chip is a source edit, not a runtime extension
//! point.

/// `DBGMCU_IDCODE` address on most STM32 parts.
pub const DBGMCU_IDCODE_ADDR: u32 = 0xE004_2000;
/// Fallback `DBGMCU_IDCODE` address on Cortex-M0 parts (STM32F0).
pub const DBGMCU_IDCODE_ADDR_M0: u32 = 0x4001_5800;

/// Replaces the source's OR-ed capability flags (`F4Flash`, `L15Flash`,
/// `L1Addrs`) with a single tagged enumeration: each family selects exactly
/// one erase strategy and one loader stub variant, so dispatch is a single
/// `match` (see [`crate::flash`]) instead of several flag tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipFamily {
    /// Unknown part; flash layout/erase strategy default to the F1 family.
    Generic,
    /// STM32F1-class FPEC flash controller at `0x4002_2000`.
    F1,
    /// STM32F4-class flash controller at `0x4002_3C00`, sector-addressed.
    F4,
    /// STM32L1-class FPEC flash controller with PEKEY/PRGKEY two-stage unlock.
    L1,
}

#[derive(Debug, Clone, Copy)]
pub struct ChipDescriptor {
    pub name: &'static str,
    pub family: ChipFamily,
    /// Expected SWD core ID; used only to emit a warning on mismatch.
    pub core_id: u32,
    pub idcode: u32,
    pub flash_base: u32,
    pub flash_size: u32,
    pub flash_page_size: u32,
    pub sys_flash_base: u32,
    pub sys_flash_size: u32,
    pub sys_flash_page_size: u32,
    pub sram_base: u32,
    pub sram_size: u32,
}

const KB: u32 = 1024;

/// The generic fallback entry. Always index 0; used whenever `DBGMCU_IDCODE`
/// fails to match any other row.
const GENERIC: ChipDescriptor = ChipDescriptor {
    name: "unknown",
    family: ChipFamily::Generic,
    core_id: 0x1BA0_1477,
    idcode: 0,
    flash_base: 0x0800_0000,
    flash_size: 128 * KB,
    flash_page_size: 1 * KB,
    sys_flash_base: 0x1FFF_F000,
    sys_flash_size: 2 * KB,
    sys_flash_page_size: 2 * KB,
    sram_base: 0x2000_0000,
    sram_size: 20 * KB,
};

/// STM32F100 (value line), e.g. the VLDiscovery board.
const STM32F100: ChipDescriptor = ChipDescriptor {
    name: "STM32F100",
    family: ChipFamily::F1,
    core_id: 0x1BA0_1477,
    idcode: 0x1001_6420,
    flash_base: 0x0800_0000,
    flash_size: 128 * KB,
    flash_page_size: 1 * KB,
    sys_flash_base: 0x1FFF_F000,
    sys_flash_size: 2 * KB,
    sys_flash_page_size: 2 * KB,
    sram_base: 0x2000_0000,
    sram_size: 8 * KB,
};

/// STM32F103 medium-density.
const STM32F103_MD: ChipDescriptor = ChipDescriptor {
    name: "STM32F103 (medium density)",
    family: ChipFamily::F1,
    core_id: 0x1BA0_1477,
    idcode: 0x2003_1410,
    flash_base: 0x0800_0000,
    flash_size: 128 * KB,
    flash_page_size: 1 * KB,
    sys_flash_base: 0x1FFF_F000,
    sys_flash_size: 2 * KB,
    sys_flash_page_size: 2 * KB,
    sram_base: 0x2000_0000,
    sram_size: 20 * KB,
};

/// STM32F103 high-density — large enough flash to exercise the F1 second
/// flash bank.
const STM32F103_HD: ChipDescriptor = ChipDescriptor {
    name: "STM32F103 (high density)",
    family: ChipFamily::F1,
    core_id: 0x1BA0_1477,
    idcode: 0x2003_1414,
    flash_base: 0x0800_0000,
    flash_size: 512 * KB,
    flash_page_size: 2 * KB,
    sys_flash_base: 0x1FFF_F000,
    sys_flash_size: 2 * KB,
    sys_flash_page_size: 2 * KB,
    sram_base: 0x2000_0000,
    sram_size: 64 * KB,
};

/// STM32F405/407.
const STM32F4: ChipDescriptor = ChipDescriptor {
    name: "STM32F405/407",
    family: ChipFamily::F4,
    core_id: 0x2BA0_1477,
    idcode: 0x1001_0413,
    flash_base: 0x0800_0000,
    flash_size: 1024 * KB,
    flash_page_size: 16 * KB, // sector 0 size; sectors are non-uniform, see flash::f4_sector_for
    sys_flash_base: 0x1FFF_0000,
    sys_flash_size: 30 * KB,
    sys_flash_page_size: 30 * KB,
    sram_base: 0x2000_0000,
    sram_size: 128 * KB,
};

/// STM32L151/L152 (medium-density Cat.3).
const STM32L151: ChipDescriptor = ChipDescriptor {
    name: "STM32L151/L152",
    family: ChipFamily::L1,
    core_id: 0x1BA0_1477,
    idcode: 0x1003_0416,
    flash_base: 0x0800_0000,
    flash_size: 128 * KB,
    flash_page_size: 256,
    sys_flash_base: 0x1FF0_0000,
    sys_flash_size: 4 * KB,
    sys_flash_page_size: 256,
    sram_base: 0x2000_0000,
    sram_size: 16 * KB,
};

/// The closed device table. `GENERIC` is always first; `identify_chip`
/// falls back to index 0 when nothing else matches.
pub const CHIP_TABLE: &[ChipDescriptor] = &[
    GENERIC,
    STM32F100,
    STM32F103_MD,
    STM32F103_HD,
    STM32F4,
    STM32L151,
];

/// Looks up a chip row by exact `DBGMCU_IDCODE` equality. Returns the
/// generic fallback index (`0`) when nothing matches.
pub fn lookup_by_idcode(idcode: u32) -> usize {
    CHIP_TABLE
        .iter()
        .position(|c| c.idcode == idcode)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_stm32f100_vldiscovery() {
        let idx = lookup_by_idcode(0x1001_6420);
        assert_eq!(CHIP_TABLE[idx].name, "STM32F100");
        assert_eq!(CHIP_TABLE[idx].flash_base, 0x0800_0000);
        assert_eq!(CHIP_TABLE[idx].flash_size, 128 * KB);
    }

    #[test]
    fn falls_back_to_generic_on_unknown_idcode() {
        let idx = lookup_by_idcode(0xffff_ffff);
        assert_eq!(idx, 0);
        assert_eq!(CHIP_TABLE[idx].family, ChipFamily::Generic);
    }
}
