//! Integration tests driving `FlashProgrammer` against `MockTransport` end
//! to end: mode-kick, chip identification, erase, chunked loader-stub write,
//! and streaming verify, for both an F1-class and an F4-class chip.

use stlink_tool::chip::ChipFamily;
use stlink_tool::flash::FlashProgrammer;
use stlink_tool::transport::MockTransport;
use stlink_tool::Session;

fn attach(transport: MockTransport) -> Session {
    let mut session = Session::attach(Box::new(transport)).expect("attach");
    session.mode_kick().expect("mode kick");
    session.identify_chip().expect("chip identification");
    session
}

#[test]
fn f1_class_program_and_verify_round_trip() {
    let mut session = attach(MockTransport::stm32f100());
    assert_eq!(session.chip().family, ChipFamily::F1);
    assert_eq!(session.chip().name, "STM32F100");

    let addr = session.chip().flash_base;
    let image: Vec<u8> = (0..4096u32).map(|b| (b % 251) as u8).collect();

    let mut flash = FlashProgrammer::new(&mut session);
    flash.mass_erase().expect("mass erase");
    flash.write(addr, &image).expect("flash write");
    flash.verify(addr, &image).expect("flash verify");
}

#[test]
fn f4_class_program_and_verify_round_trip_across_sector_boundary() {
    let mut session = attach(MockTransport::stm32f4());
    assert_eq!(session.chip().family, ChipFamily::F4);

    // sector 0 is 16 KiB; write a payload that straddles the sector 0/1
    // boundary to exercise more than one chunked loader run.
    let flash_base = session.chip().flash_base;
    let addr = flash_base + 0x3F00;
    let image: Vec<u8> = (0..4096u32).map(|b| (0xFF - (b % 256)) as u8).collect();

    let mut flash = FlashProgrammer::new(&mut session);
    flash.erase_page(flash_base).expect("erase sector 0");
    flash.erase_page(flash_base + 0x4000).expect("erase sector 1");
    flash.write(addr, &image).expect("flash write");
    flash.verify(addr, &image).expect("flash verify");
}

#[test]
fn odd_sized_payload_pads_to_a_whole_halfword() {
    let mut session = attach(MockTransport::stm32f100());
    let addr = session.chip().flash_base + 0x1000;

    let mut flash = FlashProgrammer::new(&mut session);
    flash.erase_page(addr).expect("erase");
    flash.write(addr, &[0x01, 0x02, 0x03]).expect("write odd-sized payload");

    let readback = session.read(addr, 4).unwrap();
    assert_eq!(readback, vec![0x01, 0x02, 0x03, 0xFF]);
}

#[test]
fn write_to_an_unerased_page_is_rejected() {
    let mut session = attach(MockTransport::stm32f100());
    let addr = session.chip().flash_base + 0x2000;

    // Poke a non-0xFF byte directly so the target looks unerased without
    // going through erase_page.
    session.write_mem32(addr, &[0x00, 0x00, 0x00, 0x00]).unwrap();

    let mut flash = FlashProgrammer::new(&mut session);
    let err = flash.write(addr, &[0x12, 0x34, 0x56, 0x78]).unwrap_err();
    assert!(err.to_string().contains("not erased"));
}

#[test]
fn identify_chip_matches_the_stm32f100_vldiscovery_board() {
    let mut session = attach(MockTransport::stm32f100());
    assert_eq!(session.cached_idcode(), Some(0x1001_6420));
    assert_eq!(session.chip().name, "STM32F100");
    assert_eq!(session.chip().flash_base, 0x0800_0000);
    assert_eq!(session.chip().flash_size, 128 * 1024);
}
