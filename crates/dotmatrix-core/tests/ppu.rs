mod common;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use common::{RomBuilder, dmg};
use dotmatrix_core::{
    interfaces::VideoSink,
    mmu::Mmu,
    ppu::{DMG_PALETTE, DOTS_PER_LINE, Mode, SCREEN_HEIGHT, SCREEN_WIDTH},
};

const LINE: u32 = DOTS_PER_LINE as u32;
const FRAME: u32 = LINE * 154;

fn run_dots(mmu: &mut Mmu, dots: u32) {
    assert_eq!(dots % 4, 0);
    mmu.tick(dots / 4);
}

fn lcd_off(mmu: &mut Mmu) {
    mmu.write_byte(0xFF40, mmu.read_byte(0xFF40) & 0x7F);
}

#[test]
fn line_timing_and_mode_sequence() {
    let mut mmu = Mmu::new(false, 44_100);
    assert_eq!(mmu.ppu.mode(), Mode::OamScan);
    run_dots(&mut mmu, 76);
    assert_eq!(mmu.ppu.mode(), Mode::OamScan);
    run_dots(&mut mmu, 4);
    assert_eq!(mmu.ppu.mode(), Mode::Transfer);
    assert_eq!(mmu.read_byte(0xFF41) & 0x03, 3);

    // Transfer takes at least 172 dots, and HBlank pads the line to 456.
    let mut transfer = 80;
    while mmu.ppu.mode() == Mode::Transfer {
        run_dots(&mut mmu, 4);
        transfer += 4;
    }
    assert!((172..=289).contains(&(transfer - 80)), "{transfer}");
    assert_eq!(mmu.ppu.mode(), Mode::HBlank);
    run_dots(&mut mmu, LINE - transfer - 4);
    assert_eq!(mmu.ppu.ly(), 0);
    run_dots(&mut mmu, 4);
    assert_eq!(mmu.ppu.ly(), 1);
    assert_eq!(mmu.ppu.mode(), Mode::OamScan);
}

#[test]
fn full_frame_wraps_to_line_zero() {
    let mut mmu = Mmu::new(false, 44_100);
    mmu.if_reg = 0;
    run_dots(&mut mmu, LINE * 144 - 4);
    assert_eq!(mmu.ppu.ly(), 143);
    assert_eq!(mmu.if_reg & 0x01, 0);
    run_dots(&mut mmu, 4);
    assert_eq!(mmu.ppu.ly(), 144);
    assert_eq!(mmu.ppu.mode(), Mode::VBlank);
    assert_eq!(mmu.if_reg & 0x01, 0x01);
    assert!(mmu.ppu.frame_ready());

    run_dots(&mut mmu, LINE * 10);
    assert_eq!(mmu.ppu.ly(), 0);
    assert_eq!(mmu.ppu.mode(), Mode::OamScan);
    assert_eq!(mmu.ppu.dot(), 0);
    assert_eq!(mmu.ppu.frames(), 1);
}

#[test]
fn ly_reads_zero_early_on_line_153() {
    let mut mmu = Mmu::new(false, 44_100);
    run_dots(&mut mmu, LINE * 153);
    assert_eq!(mmu.read_byte(0xFF44), 153);
    run_dots(&mut mmu, 4);
    assert_eq!(mmu.read_byte(0xFF44), 0);
    assert_eq!(mmu.ppu.mode(), Mode::VBlank);
    run_dots(&mut mmu, LINE - 4);
    assert_eq!(mmu.read_byte(0xFF44), 0);
    assert_eq!(mmu.ppu.mode(), Mode::OamScan);
}

#[test]
fn lyc_match_raises_stat_once() {
    let mut mmu = Mmu::new(false, 44_100);
    mmu.write_byte(0xFF45, 2);
    mmu.write_byte(0xFF41, 0x40);
    mmu.if_reg = 0;
    run_dots(&mut mmu, LINE * 2 - 4);
    assert_eq!(mmu.if_reg & 0x02, 0);
    run_dots(&mut mmu, 4);
    assert_eq!(mmu.if_reg & 0x02, 0x02);
    assert_eq!(mmu.read_byte(0xFF41) & 0x04, 0x04);

    mmu.if_reg = 0;
    run_dots(&mut mmu, LINE - 8);
    assert_eq!(mmu.if_reg & 0x02, 0, "line stays high for the whole line");
}

const STAT_REQUEST: u8 = 0x02;

/// Tick one M-cycle at a time until `mode` is entered, checking that no
/// STAT request is raised on the way.
fn run_until_mode(mmu: &mut Mmu, mode: Mode) {
    for _ in 0..LINE {
        if mmu.ppu.mode() == mode {
            return;
        }
        assert_eq!(mmu.if_reg & STAT_REQUEST, 0, "early request in {:?}", mmu.ppu.mode());
        mmu.tick(1);
    }
    panic!("{mode:?} never entered");
}

#[test]
fn hblank_source_raises_stat_on_entry() {
    let mut mmu = Mmu::new(false, 44_100);
    mmu.write_byte(0xFF41, 0x08);
    mmu.if_reg = 0;
    run_until_mode(&mut mmu, Mode::HBlank);
    assert_eq!(mmu.if_reg & STAT_REQUEST, STAT_REQUEST);

    mmu.if_reg = 0;
    while mmu.ppu.mode() == Mode::HBlank {
        mmu.tick(1);
    }
    assert_eq!(mmu.if_reg & STAT_REQUEST, 0, "held for the whole HBlank");
    assert_eq!(mmu.ppu.ly(), 1);
    run_until_mode(&mut mmu, Mode::HBlank);
    assert_eq!(mmu.if_reg & STAT_REQUEST, STAT_REQUEST);
}

#[test]
fn vblank_source_raises_stat_once_per_frame() {
    let mut mmu = Mmu::new(false, 44_100);
    mmu.write_byte(0xFF41, 0x10);
    mmu.if_reg = 0;
    run_dots(&mut mmu, LINE * 144 - 4);
    assert_eq!(mmu.if_reg & STAT_REQUEST, 0);
    run_dots(&mut mmu, 4);
    assert_eq!(mmu.ppu.mode(), Mode::VBlank);
    assert_eq!(mmu.if_reg & STAT_REQUEST, STAT_REQUEST);

    mmu.if_reg = 0;
    run_dots(&mut mmu, LINE * 10 - 4);
    assert_eq!(mmu.ppu.mode(), Mode::VBlank);
    assert_eq!(mmu.if_reg & STAT_REQUEST, 0);
}

#[test]
fn oam_source_raises_stat_at_each_line_start() {
    let mut mmu = Mmu::new(false, 44_100);
    mmu.write_byte(0xFF41, 0x20);
    // Enabling the source mid OAM scan is itself a rising edge.
    assert_eq!(mmu.if_reg & STAT_REQUEST, STAT_REQUEST);
    mmu.if_reg = 0;
    run_dots(&mut mmu, LINE - 4);
    assert_eq!(mmu.if_reg & STAT_REQUEST, 0);
    run_dots(&mut mmu, 4);
    assert_eq!(mmu.ppu.mode(), Mode::OamScan);
    assert_eq!(mmu.if_reg & STAT_REQUEST, STAT_REQUEST);
}

#[test]
fn source_already_high_blocks_another_request() {
    let mut mmu = Mmu::new(false, 44_100);
    mmu.write_byte(0xFF45, 0);
    mmu.write_byte(0xFF41, 0x48);
    assert_eq!(mmu.if_reg & STAT_REQUEST, STAT_REQUEST);
    mmu.if_reg = 0;

    // LYC=LY keeps the line high, so HBlank on line 0 adds nothing.
    while mmu.ppu.mode() != Mode::HBlank {
        mmu.tick(1);
    }
    assert_eq!(mmu.if_reg & STAT_REQUEST, 0);

    // Line 1 drops the coincidence and HBlank is a fresh edge.
    while mmu.ppu.mode() == Mode::HBlank {
        mmu.tick(1);
    }
    run_until_mode(&mut mmu, Mode::HBlank);
    assert_eq!(mmu.if_reg & STAT_REQUEST, STAT_REQUEST);
}

fn place_sprites(mmu: &mut Mmu, count: u8) {
    lcd_off(mmu);
    for i in 0..count {
        let base = 0xFE00 + i as u16 * 4;
        mmu.write_byte(base, 16);
        mmu.write_byte(base + 1, 100 - i * 5);
        mmu.write_byte(base + 2, 0);
        mmu.write_byte(base + 3, 0);
    }
    mmu.write_byte(0xFF40, 0x93);
    run_dots(mmu, 4);
}

#[test]
fn sprite_selection_keeps_ten_lowest_x_on_dmg() {
    let mut mmu = Mmu::new(false, 44_100);
    place_sprites(&mut mmu, 12);
    let picked: Vec<u8> = mmu.ppu.line_sprites().iter().map(|s| s.oam_index).collect();
    assert_eq!(picked, vec![11, 10, 9, 8, 7, 6, 5, 4, 3, 2]);
}

#[test]
fn sprite_selection_keeps_oam_order_on_cgb() {
    let mut mmu = Mmu::new(true, 44_100);
    place_sprites(&mut mmu, 12);
    let picked: Vec<u8> = mmu.ppu.line_sprites().iter().map(|s| s.oam_index).collect();
    assert_eq!(picked, (0..10).collect::<Vec<u8>>());

    // OPRI bit 0 switches to X priority.
    mmu.write_byte(0xFF6C, 0x01);
    run_dots(&mut mmu, LINE);
    let picked: Vec<u8> = mmu.ppu.line_sprites().iter().map(|s| s.oam_index).collect();
    assert_eq!(picked[0], 11);
    assert_eq!(picked.len(), 10);
}

#[test]
fn vram_and_oam_locked_by_mode() {
    let mut mmu = Mmu::new(false, 44_100);
    lcd_off(&mut mmu);
    mmu.write_byte(0x8000, 0x11);
    mmu.write_byte(0xFE00, 0x22);
    mmu.write_byte(0xFF40, 0x91);

    // OAM scan: OAM closed, VRAM open.
    assert_eq!(mmu.read_byte(0xFE00), 0xFF);
    assert_eq!(mmu.read_byte(0x8000), 0x11);

    run_dots(&mut mmu, 80);
    assert_eq!(mmu.ppu.mode(), Mode::Transfer);
    assert_eq!(mmu.read_byte(0x8000), 0xFF);
    assert_eq!(mmu.read_byte(0xFE00), 0xFF);
    mmu.write_byte(0x8000, 0x99);

    while mmu.ppu.mode() != Mode::HBlank {
        run_dots(&mut mmu, 4);
    }
    assert_eq!(mmu.read_byte(0x8000), 0x11, "write during transfer ignored");
    assert_eq!(mmu.read_byte(0xFE00), 0x22);
}

#[test]
fn lcd_off_resets_line_state() {
    let mut mmu = Mmu::new(false, 44_100);
    run_dots(&mut mmu, LINE * 5 + 100);
    lcd_off(&mut mmu);
    assert_eq!(mmu.read_byte(0xFF44), 0);
    assert_eq!(mmu.read_byte(0xFF41) & 0x03, 0);
    run_dots(&mut mmu, LINE * 3);
    assert_eq!(mmu.read_byte(0xFF44), 0, "no progress while off");
    mmu.write_byte(0xFF40, 0x91);
    assert_eq!(mmu.ppu.mode(), Mode::OamScan);
}

#[test]
fn window_counter_follows_rendered_lines() {
    let mut mmu = Mmu::new(false, 44_100);
    lcd_off(&mut mmu);
    mmu.write_byte(0xFF4A, 0);
    mmu.write_byte(0xFF4B, 7);
    mmu.write_byte(0xFF40, 0xB1);
    run_dots(&mut mmu, LINE * 10);
    assert_eq!(mmu.ppu.window_line_counter(), 10);

    // Pushed off the right edge the window never renders.
    mmu.write_byte(0xFF4B, 0xFF);
    run_dots(&mut mmu, LINE * 5);
    assert_eq!(mmu.ppu.window_line_counter(), 10);

    // Reset when the next frame starts.
    run_dots(&mut mmu, FRAME - LINE * 15);
    assert_eq!(mmu.ppu.ly(), 0);
    assert_eq!(mmu.ppu.window_line_counter(), 0);
}

#[test]
fn solid_tile_fills_frame() {
    let mut mmu = Mmu::new(false, 44_100);
    lcd_off(&mut mmu);
    for addr in 0x8000..0x8010 {
        mmu.write_byte(addr, 0xFF);
    }
    mmu.write_byte(0xFF40, 0x91);
    run_dots(&mut mmu, FRAME);
    assert!(mmu.ppu.frame_ready());
    let frame = mmu.ppu.front_buffer();
    assert_eq!(frame.len(), SCREEN_WIDTH * SCREEN_HEIGHT);
    assert!(frame.iter().all(|&px| px == DMG_PALETTE[3]));
}

struct CountingSink(Arc<AtomicUsize>);

impl VideoSink for CountingSink {
    fn draw(&mut self, pixels: &[u32], pitch: usize) {
        assert_eq!(pixels.len(), SCREEN_WIDTH * SCREEN_HEIGHT);
        assert_eq!(pitch, SCREEN_WIDTH);
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn run_frame_hands_each_frame_to_sink() {
    // JR -2 forever.
    let rom = RomBuilder::new(0x00).code(&[0x18, 0xFE]).build();
    let mut gb = dmg(rom);
    let frames = Arc::new(AtomicUsize::new(0));
    gb.set_video_sink(Box::new(CountingSink(frames.clone())));
    for _ in 0..3 {
        assert!(gb.run_frame());
    }
    assert_eq!(frames.load(Ordering::SeqCst), 3);
    assert_eq!(gb.mmu.ppu.frames(), 3);
}
