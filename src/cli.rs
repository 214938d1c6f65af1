use std::path::PathBuf;

use structopt::StructOpt;

/// Parses a `u32` from decimal or `0x`-prefixed hex, the way every address
/// argument on this command line accepts either.
pub fn parse_u32(src: &str) -> Result<u32, std::num::ParseIntError> {
    if let Some(hex) = src.strip_prefix("0x").or_else(|| src.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        src.parse::<u32>()
    }
}

/// Same as [`parse_u32`] but for the 16-bit VID/PID options.
pub fn parse_u16(src: &str) -> Result<u16, std::num::ParseIntError> {
    if let Some(hex) = src.strip_prefix("0x").or_else(|| src.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        src.parse::<u16>()
    }
}

/// Same as [`parse_u32`] but for an 8-bit core register index.
pub fn parse_u8(src: &str) -> Result<u8, std::num::ParseIntError> {
    if let Some(hex) = src.strip_prefix("0x").or_else(|| src.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16)
    } else {
        src.parse::<u8>()
    }
}

#[derive(StructOpt, Debug)]
pub enum Command {
    /// Erase and write a raw binary image to flash at its start address
    Program {
        /// Address to program at
        #[structopt(long, parse(try_from_str = parse_u32), default_value = "0x8000000")]
        address: u32,
        /// Path to the binary image
        file: PathBuf,
    },
    /// Print the connected chip's descriptor and core state
    Info,
    /// Print the dongle's firmware version and VID/PID
    Version,
    /// Toggle mode-kick and report success, without touching the target
    Blink,
    /// Dump the ARM core register file
    Regs,
    /// Read one core register
    Reg {
        #[structopt(parse(try_from_str = parse_u8))]
        n: u8,
    },
    /// Write one core register
    WReg {
        #[structopt(parse(try_from_str = parse_u8))]
        n: u8,
        #[structopt(parse(try_from_str = parse_u32))]
        v: u32,
    },
    /// Reset the target core
    Reset,
    /// Resume core execution
    Run,
    /// Single-step the core
    Step,
    /// Print the core's run state
    Status,
    /// Kick the dongle into debug mode
    Debug,
    /// Erase one page, or every user page when no address is given
    Erase {
        #[structopt(parse(try_from_str = parse_u32))]
        addr: Option<u32>,
    },
    /// Read 32 bits of target memory
    Read {
        #[structopt(parse(try_from_str = parse_u32))]
        addr: u32,
    },
    /// Write 32 bits of target memory
    Write {
        #[structopt(parse(try_from_str = parse_u32))]
        addr: u32,
        #[structopt(parse(try_from_str = parse_u32))]
        val: u32,
    },
    /// Read flash contents to a file
    FlashRead {
        #[structopt(parse(try_from_str = parse_u32))]
        addr: u32,
        #[structopt(parse(try_from_str = parse_u32))]
        len: u32,
        file: PathBuf,
    },
    /// Write a file's contents to flash, erasing as needed
    FlashWrite {
        #[structopt(parse(try_from_str = parse_u32))]
        addr: u32,
        file: PathBuf,
    },
    /// Verify flash contents against a file
    FlashVerify {
        #[structopt(parse(try_from_str = parse_u32))]
        addr: u32,
        file: PathBuf,
    },
    /// Read the system memory (bootloader ROM) to a file
    SysRead {
        #[structopt(parse(try_from_str = parse_u32))]
        len: u32,
        file: PathBuf,
    },
}

#[derive(StructOpt, Debug)]
#[structopt(name = "stlink-tool", about = "Host-side programmer for STM32 targets over an STLink v2 dongle")]
pub struct Opts {
    #[structopt(subcommand)]
    pub command: Command,

    /// Override the expected dongle vendor ID
    #[structopt(env = "STLINK_VID", long = "vid", parse(try_from_str = parse_u16), default_value = "0x0483")]
    pub vid: u16,
    /// Override the expected dongle product ID
    #[structopt(env = "STLINK_PID", long = "pid", parse(try_from_str = parse_u16), default_value = "0x3748")]
    pub pid: u16,
}
