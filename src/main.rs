mod cli;

use std::convert::TryInto;
use std::fs;
use std::process::exit;

use anyhow::{Context, Result};
use structopt::StructOpt;

use stlink_tool::flash::FlashProgrammer;
use stlink_tool::transport::RusbTransport;
use stlink_tool::Session;

use cli::{Command, Opts};

fn main() {
    pretty_env_logger::init();

    let opts = Opts::from_args();

    if let Err(e) = run(opts) {
        log::error!("{:#}", e);
        exit(2);
    }
}

fn run(opts: Opts) -> Result<()> {
    let transport = RusbTransport::open(opts.vid, opts.pid)
        .with_context(|| format!("could not open STLink dongle ({:#06x}:{:#06x})", opts.vid, opts.pid))?;
    let mut session = Session::attach(Box::new(transport)).context("could not attach to dongle")?;

    match opts.command {
        Command::Version => {
            let version = session.version();
            println!(
                "STLink v{} (jtag {}, swim {}), VID:PID {:#06x}:{:#06x}",
                version.stlink_major, version.jtag_version, version.swim_version, version.vid, version.pid
            );
        }
        Command::Blink => {
            session.mode_kick().context("mode kick failed")?;
            println!("mode kick succeeded; core state is {:?}", session.status()?);
        }
        Command::Info => {
            session.mode_kick().context("mode kick failed")?;
            session.identify_chip().context("chip identification failed")?;
            let chip = session.chip();
            println!("chip: {}", chip.name);
            println!("idcode: {:#010x}", session.cached_idcode().unwrap_or(0));
            println!("flash: {} KiB at {:#010x}", session.flash_size_kb().unwrap_or(0), chip.flash_base);
            println!("sram: {} KiB at {:#010x}", chip.sram_size / 1024, chip.sram_base);
        }
        Command::Regs => {
            session.mode_kick().context("mode kick failed")?;
            let regs = session.read_all_regs()?;
            for i in 0..21 {
                println!("r{:<3} {:#010x}", i, regs.get(i));
            }
        }
        Command::Reg { n } => {
            session.mode_kick().context("mode kick failed")?;
            println!("{:#010x}", session.read_reg(n)?);
        }
        Command::WReg { n, v } => {
            session.mode_kick().context("mode kick failed")?;
            session.write_reg(n, v)?;
        }
        Command::Reset => {
            session.mode_kick().context("mode kick failed")?;
            session.reset()?;
        }
        Command::Run => {
            session.mode_kick().context("mode kick failed")?;
            session.run()?;
        }
        Command::Step => {
            session.mode_kick().context("mode kick failed")?;
            session.step()?;
        }
        Command::Status => {
            session.mode_kick().context("mode kick failed")?;
            println!("{:?}", session.status()?);
        }
        Command::Debug => {
            session.mode_kick().context("mode kick failed")?;
            println!("now in {:?} mode", session.status()?);
        }
        Command::Erase { addr } => {
            session.mode_kick().context("mode kick failed")?;
            session.identify_chip().context("chip identification failed")?;
            let mut flash = FlashProgrammer::new(&mut session);
            match addr {
                Some(addr) => flash.erase_page(addr).context("page erase failed")?,
                None => flash.mass_erase().context("mass erase failed")?,
            }
        }
        Command::Read { addr } => {
            session.mode_kick().context("mode kick failed")?;
            let bytes = session.read(addr, 4)?;
            println!("{:#010x}", u32::from_le_bytes(bytes.try_into().unwrap()));
        }
        Command::Write { addr, val } => {
            session.mode_kick().context("mode kick failed")?;
            session.write_mem32(addr, &val.to_le_bytes())?;
        }
        Command::Program { address, file } => {
            let data = fs::read(&file).with_context(|| format!("could not read {}", file.display()))?;
            session.mode_kick().context("mode kick failed")?;
            session.identify_chip().context("chip identification failed")?;
            let mut flash = FlashProgrammer::new(&mut session);
            flash.mass_erase().context("mass erase failed")?;
            flash.write(address, &data).context("flash write failed")?;
            flash.verify(address, &data).context("flash verify failed")?;
            println!("programmed {} bytes at {:#010x}", data.len(), address);
        }
        Command::FlashRead { addr, len, file } => {
            session.mode_kick().context("mode kick failed")?;
            let data = session.read(addr, len as usize)?;
            fs::write(&file, &data).with_context(|| format!("could not write {}", file.display()))?;
        }
        Command::FlashWrite { addr, file } => {
            let data = fs::read(&file).with_context(|| format!("could not read {}", file.display()))?;
            session.mode_kick().context("mode kick failed")?;
            session.identify_chip().context("chip identification failed")?;
            let mut flash = FlashProgrammer::new(&mut session);
            flash.write(addr, &data).context("flash write failed")?;
        }
        Command::FlashVerify { addr, file } => {
            let data = fs::read(&file).with_context(|| format!("could not read {}", file.display()))?;
            session.mode_kick().context("mode kick failed")?;
            let mut flash = FlashProgrammer::new(&mut session);
            flash.verify(addr, &data).context("flash verify failed")?;
            println!("verify OK");
        }
        Command::SysRead { len, file } => {
            session.mode_kick().context("mode kick failed")?;
            session.identify_chip().context("chip identification failed")?;
            let base = session.chip().sys_flash_base;
            let data = session.read(base, len as usize)?;
            fs::write(&file, &data).with_context(|| format!("could not write {}", file.display()))?;
        }
    }

    Ok(())
}
