mod common;

use common::{RomBuilder, cgb, dmg};
use dotmatrix_core::{
    GameBoy,
    snapshot::{SNAPSHOT_MAGIC, SnapshotError, read_header},
};

/// Copies LY into SCX and counts in B/C000 forever.
fn scroller() -> RomBuilder {
    RomBuilder::new(0x00).code(&[
        0xF0, 0x44, // LDH A,(LY)
        0xE0, 0x43, // LDH (SCX),A
        0x04, // INC B
        0x78, // LD A,B
        0xEA, 0x00, 0xC0, // LD (C000),A
        0x18, 0xF5, // JR 0150
    ])
}

fn seeded(rom: Vec<u8>) -> GameBoy {
    let mut gb = dmg(rom);
    for i in 0..0x10u16 {
        gb.mmu.write_byte(0x8000 + i, if i % 2 == 0 { 0x0F } else { 0x3C });
    }
    gb
}

fn record(gb: &mut GameBoy, frames: usize) -> Vec<(Vec<u32>, u64)> {
    (0..frames)
        .map(|_| {
            assert!(gb.run_frame());
            (gb.frame().to_vec(), gb.cpu.cycles)
        })
        .collect()
}

#[test]
fn restore_replays_identically() {
    let mut gb = seeded(scroller().build());
    record(&mut gb, 2);
    let snap = gb.snapshot().unwrap();
    assert_eq!(&snap[..8], SNAPSHOT_MAGIC);

    let first = record(&mut gb, 3);
    gb.restore(&snap).unwrap();
    let second = record(&mut gb, 3);
    assert_eq!(first, second);

    let mut other = dmg(scroller().build());
    other.restore(&snap).unwrap();
    assert_eq!(record(&mut other, 3), first);
}

#[test]
fn header_names_the_cartridge() {
    let gb = dmg(scroller().title("HEADER").build());
    let snap = gb.snapshot().unwrap();
    let (header, _) = read_header(&snap).unwrap();
    assert_eq!(header.cartridge.unwrap().title, "HEADER");
    assert!(!header.cgb);
}

#[test]
fn rejects_other_cartridge() {
    let gb = dmg(scroller().title("FIRST").build());
    let snap = gb.snapshot().unwrap();
    let mut other = dmg(scroller().title("SECOND").build());
    let before = other.cpu.pc;
    match other.restore(&snap) {
        Err(SnapshotError::CartridgeMismatch { expected, found }) => {
            assert_eq!(expected.unwrap().title, "SECOND");
            assert_eq!(found.unwrap().title, "FIRST");
        }
        result => panic!("unexpected result: {result:?}"),
    }
    assert_eq!(other.cpu.pc, before);
}

#[test]
fn rejects_other_hardware_mode() {
    let gb = dmg(scroller().build());
    let snap = gb.snapshot().unwrap();
    let mut color = cgb(scroller().build());
    assert!(matches!(
        color.restore(&snap),
        Err(SnapshotError::ModeMismatch(false))
    ));
}

#[test]
fn rejects_damaged_data() {
    let mut gb = dmg(scroller().build());
    let snap = gb.snapshot().unwrap();

    let mut bad_magic = snap.clone();
    bad_magic[0] = b'X';
    assert!(matches!(gb.restore(&bad_magic), Err(SnapshotError::BadMagic)));

    let mut bad_version = snap.clone();
    bad_version[8] = 0x7F;
    assert!(matches!(
        gb.restore(&bad_version),
        Err(SnapshotError::UnsupportedVersion(0x7F))
    ));

    let truncated = &snap[..snap.len() / 2];
    assert!(matches!(gb.restore(truncated), Err(SnapshotError::Decode(_))));
    gb.restore(&snap).unwrap();
}

#[test]
fn cartridge_banking_and_clock_are_captured() {
    let rom = RomBuilder::new(0x10).rom_banks(8).ram_size(0x03).build();
    let mut gb = dmg(rom);
    gb.mmu.write_byte(0x0000, 0x0A);
    gb.mmu.write_byte(0x2000, 0x05);
    gb.mmu.write_byte(0x4000, 0x01);
    gb.mmu.write_byte(0xA123, 0x99);
    gb.mmu.write_byte(0x4000, 0x09);
    gb.mmu.write_byte(0xA000, 17);
    let snap = gb.snapshot().unwrap();

    gb.mmu.write_byte(0xA000, 3);
    gb.mmu.write_byte(0x4000, 0x01);
    gb.mmu.write_byte(0xA123, 0x00);
    gb.mmu.write_byte(0x2000, 0x02);

    gb.restore(&snap).unwrap();
    assert_eq!(gb.mmu.read_byte(0x6000), 5);
    gb.mmu.write_byte(0x6000, 0x00);
    gb.mmu.write_byte(0x6000, 0x01);
    assert_eq!(gb.mmu.read_byte(0xA000), 17);
    gb.mmu.write_byte(0x4000, 0x01);
    assert_eq!(gb.mmu.read_byte(0xA123), 0x99);
}
