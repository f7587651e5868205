//! Per-scanline pixel fetcher and FIFOs used during pixel transfer.
//!
//! The fetcher walks tile-index, low byte, high byte and idle on every
//! other dot, then tries to push eight pixels each dot until the
//! background FIFO has room. One pixel leaves the FIFO per dot while more
//! than eight are queued. Window entry and sprite fetches stall output.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::ppu::VRAM_BANK_SIZE;

/// Visible width of a scanline.
const LINE_WIDTH: u8 = 160;
/// Dots the FIFO is frozen while an object's tile row is fetched.
const SPRITE_FETCH_DOTS: u8 = 6;
const WINDOW_X_MAX: u8 = 166;

const BG_MAP_0: usize = 0x1800;
const BG_MAP_1: usize = 0x1C00;

/// One OAM entry selected for the current line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sprite {
    pub y: u8,
    pub x: u8,
    pub tile: u8,
    pub flags: u8,
    pub oam_index: u8,
}

impl Sprite {
    pub fn from_oam(oam: &[u8], index: usize) -> Self {
        let base = index * 4;
        Self {
            y: oam[base],
            x: oam[base + 1],
            tile: oam[base + 2],
            flags: oam[base + 3],
            oam_index: index as u8,
        }
    }

    fn behind_bg(&self) -> bool {
        self.flags & 0x80 != 0
    }

    fn flip_y(&self) -> bool {
        self.flags & 0x40 != 0
    }

    fn flip_x(&self) -> bool {
        self.flags & 0x20 != 0
    }

    fn dmg_palette(&self) -> u8 {
        (self.flags >> 4) & 0x01
    }

    fn bank(&self) -> usize {
        ((self.flags >> 3) & 0x01) as usize
    }

    fn cgb_palette(&self) -> u8 {
        self.flags & 0x07
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchState {
    Tile,
    TileDataLow,
    TileDataHigh,
    Idle,
    Push,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct TileAttributes {
    palette: u8,
    bank: usize,
    flip_x: bool,
    flip_y: bool,
    priority: bool,
}

impl TileAttributes {
    fn from_byte(attr: u8) -> Self {
        Self {
            palette: attr & 0x07,
            bank: ((attr >> 3) & 0x01) as usize,
            flip_x: attr & 0x20 != 0,
            flip_y: attr & 0x40 != 0,
            priority: attr & 0x80 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct BgPixel {
    color: u8,
    palette: u8,
    priority: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct ObjPixel {
    color: u8,
    palette: u8,
    behind_bg: bool,
    oam_index: u8,
}

/// Palette a finished pixel must be looked up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelSource {
    Background { palette: u8 },
    /// `palette` is OBP0/OBP1 on DMG and the CGB object palette number otherwise.
    Object { palette: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputPixel {
    pub x: u8,
    pub color: u8,
    pub source: PixelSource,
}

/// Registers and memory the fetcher reads on each dot.
pub struct LineContext<'a> {
    pub vram: &'a [u8],
    pub sprites: &'a [Sprite],
    pub cgb: bool,
    pub lcdc: u8,
    pub scx: u8,
    pub scy: u8,
    pub ly: u8,
    pub wx: u8,
    /// WY matched LY on some earlier line of this frame.
    pub wy_triggered: bool,
    pub window_line: u8,
    /// CGB object priority by OAM index rather than X position.
    pub oam_order_priority: bool,
}

impl LineContext<'_> {
    fn vram_byte(&self, bank: usize, offset: usize) -> u8 {
        self.vram[bank * VRAM_BANK_SIZE + (offset & (VRAM_BANK_SIZE - 1))]
    }

    fn window_enabled(&self) -> bool {
        self.lcdc & 0x20 != 0 && self.wy_triggered && self.wx <= WINDOW_X_MAX
    }

    fn objects_enabled(&self) -> bool {
        self.lcdc & 0x02 != 0
    }

    fn sprite_height(&self) -> u8 {
        if self.lcdc & 0x04 != 0 { 16 } else { 8 }
    }

    /// Offset of the first byte of tile `id` in VRAM under LCDC bit 4.
    fn tile_data_offset(&self, id: u8) -> usize {
        if self.lcdc & 0x10 != 0 {
            id as usize * 16
        } else {
            (0x1000 + (id as i8 as i32) * 16) as usize
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    state: FetchState,
    dots: u32,
    /// Tile column fetched next, relative to the line start.
    fetcher_x: u8,
    tile_id: u8,
    attrs: TileAttributes,
    data_low: u8,
    data_high: u8,
    bg_fifo: VecDeque<BgPixel>,
    /// Object pixels aligned with the next screen columns to be output.
    obj_fifo: VecDeque<ObjPixel>,
    pushed_x: u8,
    /// Pixels still to drop before output starts (fine scroll or WX < 7).
    discard: u8,
    fetching_window: bool,
    window_tile_x: u8,
    sprite_stall: u8,
    pending_sprite: Option<usize>,
    /// Bit per entry of the line's sprite list already merged.
    fetched_sprites: u16,
}

impl Pipeline {
    pub fn new(scx: u8) -> Self {
        Self {
            state: FetchState::Tile,
            dots: 0,
            fetcher_x: 0,
            tile_id: 0,
            attrs: TileAttributes::default(),
            data_low: 0,
            data_high: 0,
            bg_fifo: VecDeque::with_capacity(16),
            obj_fifo: VecDeque::with_capacity(8),
            pushed_x: 0,
            discard: scx % 8,
            fetching_window: false,
            window_tile_x: 0,
            sprite_stall: 0,
            pending_sprite: None,
            fetched_sprites: 0,
        }
    }

    pub fn line_done(&self) -> bool {
        self.pushed_x >= LINE_WIDTH
    }

    /// The window was drawn somewhere on this line.
    pub fn window_rendered(&self) -> bool {
        self.fetching_window
    }

    pub fn state(&self) -> FetchState {
        self.state
    }

    /// Advance one dot, returning the pixel output on this dot if any.
    pub fn tick(&mut self, ctx: &LineContext) -> Option<OutputPixel> {
        if self.line_done() {
            return None;
        }
        self.dots += 1;

        if self.sprite_stall > 0 {
            self.sprite_stall -= 1;
            if self.sprite_stall == 0
                && let Some(slot) = self.pending_sprite.take()
            {
                self.merge_sprite(ctx, slot);
            }
            return None;
        }

        if self.dots & 1 == 1 {
            self.fetch_step(ctx);
        }
        if self.state == FetchState::Push && self.push_row(ctx) {
            self.state = FetchState::Tile;
        }

        if self.bg_fifo.len() <= 8 {
            return None;
        }

        if self.discard > 0 {
            self.bg_fifo.pop_front();
            self.discard -= 1;
            return None;
        }

        if !self.fetching_window && ctx.window_enabled() && self.pushed_x + 7 >= ctx.wx {
            self.start_window(ctx);
            return None;
        }

        if ctx.objects_enabled()
            && let Some(slot) = self.next_sprite(ctx)
        {
            self.fetched_sprites |= 1 << slot;
            self.pending_sprite = Some(slot);
            // This dot is the first of the fetch.
            self.sprite_stall = SPRITE_FETCH_DOTS - 1;
            return None;
        }

        let bg = self.bg_fifo.pop_front()?;
        let obj = self.obj_fifo.pop_front();
        let x = self.pushed_x;
        self.pushed_x += 1;
        Some(Self::mix(ctx, x, bg, obj))
    }

    fn fetch_step(&mut self, ctx: &LineContext) {
        match self.state {
            FetchState::Tile => {
                self.fetch_tile(ctx);
                self.state = FetchState::TileDataLow;
            }
            FetchState::TileDataLow => {
                self.data_low = self.tile_byte(ctx, 0);
                self.state = FetchState::TileDataHigh;
            }
            FetchState::TileDataHigh => {
                self.data_high = self.tile_byte(ctx, 1);
                self.state = FetchState::Idle;
            }
            FetchState::Idle => self.state = FetchState::Push,
            FetchState::Push => {}
        }
    }

    fn fetch_tile(&mut self, ctx: &LineContext) {
        let (map_base, column, row) = if self.fetching_window {
            let base = if ctx.lcdc & 0x40 != 0 { BG_MAP_1 } else { BG_MAP_0 };
            let column = self.window_tile_x as usize & 0x1F;
            self.window_tile_x = self.window_tile_x.wrapping_add(1);
            (base, column, ctx.window_line as usize / 8)
        } else {
            let base = if ctx.lcdc & 0x08 != 0 { BG_MAP_1 } else { BG_MAP_0 };
            let column = ((ctx.scx / 8) as usize + self.fetcher_x as usize) & 0x1F;
            let row = ctx.ly.wrapping_add(ctx.scy) as usize / 8;
            (base, column, row)
        };
        self.fetcher_x = self.fetcher_x.wrapping_add(1);

        let map_offset = map_base + row * 32 + column;
        self.tile_id = ctx.vram_byte(0, map_offset);
        self.attrs = if ctx.cgb {
            TileAttributes::from_byte(ctx.vram_byte(1, map_offset))
        } else {
            TileAttributes::default()
        };
    }

    fn tile_byte(&self, ctx: &LineContext, high: usize) -> u8 {
        let mut row = if self.fetching_window {
            ctx.window_line % 8
        } else {
            ctx.ly.wrapping_add(ctx.scy) % 8
        } as usize;
        if self.attrs.flip_y {
            row = 7 - row;
        }
        let offset = ctx.tile_data_offset(self.tile_id) + row * 2 + high;
        ctx.vram_byte(self.attrs.bank, offset)
    }

    /// Push the fetched row as eight pixels if the FIFO has room.
    fn push_row(&mut self, ctx: &LineContext) -> bool {
        if self.bg_fifo.len() > 8 {
            return false;
        }
        // DMG with LCDC.0 clear shows colour 0 for background and window.
        let blank = !ctx.cgb && ctx.lcdc & 0x01 == 0;
        for i in 0..8 {
            let bit = if self.attrs.flip_x { i } else { 7 - i };
            let color = if blank {
                0
            } else {
                (((self.data_high >> bit) & 1) << 1) | ((self.data_low >> bit) & 1)
            };
            self.bg_fifo.push_back(BgPixel {
                color,
                palette: self.attrs.palette,
                priority: self.attrs.priority,
            });
        }
        true
    }

    fn start_window(&mut self, ctx: &LineContext) {
        self.bg_fifo.clear();
        self.state = FetchState::Tile;
        self.fetching_window = true;
        self.window_tile_x = 0;
        if ctx.wx < 7 && self.pushed_x == 0 {
            self.discard = 7 - ctx.wx;
        }
    }

    /// First selected sprite, not yet merged, whose left edge has been reached.
    fn next_sprite(&self, ctx: &LineContext) -> Option<usize> {
        ctx.sprites.iter().enumerate().find_map(|(slot, s)| {
            let pending = self.fetched_sprites & (1 << slot) == 0;
            let on_screen = s.x != 0 && s.x < LINE_WIDTH + 8;
            (pending && on_screen && s.x <= self.pushed_x + 8).then_some(slot)
        })
    }

    fn merge_sprite(&mut self, ctx: &LineContext, slot: usize) {
        let Some(sprite) = ctx.sprites.get(slot).copied() else {
            return;
        };
        let height = ctx.sprite_height();
        // LCDC.2 may have shrunk the object since OAM scan; the row wraps.
        let mut row = ctx.ly.wrapping_add(16).wrapping_sub(sprite.y) & (height - 1);
        if sprite.flip_y() {
            row = height - 1 - row;
        }
        let tile = if height == 16 {
            sprite.tile & 0xFE
        } else {
            sprite.tile
        };
        let bank = if ctx.cgb { sprite.bank() } else { 0 };
        let offset = tile as usize * 16 + row as usize * 2;
        let low = ctx.vram_byte(bank, offset);
        let high = ctx.vram_byte(bank, offset + 1);
        let palette = if ctx.cgb {
            sprite.cgb_palette()
        } else {
            sprite.dmg_palette()
        };

        let left = sprite.x as i16 - 8;
        for i in 0..8u8 {
            let column = left + i as i16;
            if column < self.pushed_x as i16 {
                continue;
            }
            let slot_index = (column - self.pushed_x as i16) as usize;
            while self.obj_fifo.len() <= slot_index {
                self.obj_fifo.push_back(ObjPixel::default());
            }
            let bit = if sprite.flip_x() { i } else { 7 - i };
            let color = (((high >> bit) & 1) << 1) | ((low >> bit) & 1);
            let incoming = ObjPixel {
                color,
                palette,
                behind_bg: sprite.behind_bg(),
                oam_index: sprite.oam_index,
            };
            let existing = &mut self.obj_fifo[slot_index];
            let replace = existing.color == 0
                || (ctx.oam_order_priority
                    && color != 0
                    && incoming.oam_index < existing.oam_index);
            if replace {
                *existing = incoming;
            }
        }
    }

    fn mix(ctx: &LineContext, x: u8, bg: BgPixel, obj: Option<ObjPixel>) -> OutputPixel {
        let background = OutputPixel {
            x,
            color: bg.color,
            source: PixelSource::Background {
                palette: bg.palette,
            },
        };
        let Some(obj) = obj.filter(|o| o.color != 0) else {
            return background;
        };
        let object = OutputPixel {
            x,
            color: obj.color,
            source: PixelSource::Object {
                palette: obj.palette,
            },
        };
        // On CGB, LCDC.0 clear strips background priority entirely.
        if ctx.cgb && ctx.lcdc & 0x01 == 0 {
            return object;
        }
        if bg.color == 0 || (!obj.behind_bg && !bg.priority) {
            object
        } else {
            background
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context<'a>(vram: &'a [u8], sprites: &'a [Sprite]) -> LineContext<'a> {
        LineContext {
            vram,
            sprites,
            cgb: false,
            lcdc: 0x93,
            scx: 0,
            scy: 0,
            ly: 0,
            wx: 0,
            wy_triggered: false,
            window_line: 0,
            oam_order_priority: false,
        }
    }

    fn run_line(pipeline: &mut Pipeline, ctx: &LineContext) -> (Vec<OutputPixel>, u32) {
        let mut out = Vec::new();
        let mut dots = 0;
        while !pipeline.line_done() {
            dots += 1;
            if let Some(px) = pipeline.tick(ctx) {
                out.push(px);
            }
            assert!(dots < 400, "line never finished");
        }
        (out, dots)
    }

    #[test]
    fn fetcher_cycles_through_states_on_odd_dots() {
        let vram = vec![0u8; VRAM_BANK_SIZE * 2];
        let ctx = context(&vram, &[]);
        let mut p = Pipeline::new(0);
        assert_eq!(p.state(), FetchState::Tile);
        p.tick(&ctx);
        assert_eq!(p.state(), FetchState::TileDataLow);
        p.tick(&ctx);
        assert_eq!(p.state(), FetchState::TileDataLow);
        p.tick(&ctx);
        assert_eq!(p.state(), FetchState::TileDataHigh);
    }

    #[test]
    fn outputs_every_column_once() {
        let mut vram = vec![0u8; VRAM_BANK_SIZE * 2];
        // Tile 0 row 0: colour 3 in the leftmost column only.
        vram[0] = 0x80;
        vram[1] = 0x80;
        let ctx = context(&vram, &[]);
        let mut p = Pipeline::new(0);
        let (out, _) = run_line(&mut p, &ctx);
        assert_eq!(out.len(), 160);
        assert!(out.iter().enumerate().all(|(i, px)| px.x as usize == i));
        assert_eq!(out[0].color, 3);
        assert_eq!(out[1].color, 0);
        assert_eq!(out[8].color, 3);
    }

    #[test]
    fn fine_scroll_lengthens_the_line() {
        let vram = vec![0u8; VRAM_BANK_SIZE * 2];
        let ctx = context(&vram, &[]);
        let (_, plain) = run_line(&mut Pipeline::new(0), &ctx);
        let mut scrolled_ctx = context(&vram, &[]);
        scrolled_ctx.scx = 5;
        let (_, scrolled) = run_line(&mut Pipeline::new(5), &scrolled_ctx);
        assert_eq!(scrolled, plain + 5);
    }

    #[test]
    fn sprite_fetch_stalls_and_overlays() {
        let mut vram = vec![0u8; VRAM_BANK_SIZE * 2];
        // Tile 1 row 0 solid colour 1.
        vram[16] = 0xFF;
        let sprites = [Sprite {
            y: 16,
            x: 8 + 20,
            tile: 1,
            flags: 0,
            oam_index: 0,
        }];
        let plain_ctx = context(&vram, &[]);
        let (_, plain) = run_line(&mut Pipeline::new(0), &plain_ctx);
        let ctx = context(&vram, &sprites);
        let (out, dots) = run_line(&mut Pipeline::new(0), &ctx);
        assert_eq!(dots, plain + SPRITE_FETCH_DOTS as u32);
        for px in &out[20..28] {
            assert_eq!(px.color, 1);
            assert_eq!(px.source, PixelSource::Object { palette: 0 });
        }
        assert_eq!(out[19].source, PixelSource::Background { palette: 0 });
        assert_eq!(out[28].source, PixelSource::Background { palette: 0 });
    }

    #[test]
    fn behind_bg_sprite_loses_to_opaque_background() {
        let mut vram = vec![0u8; VRAM_BANK_SIZE * 2];
        // Background tile 0 row 0: colour 1 everywhere.
        vram[0] = 0xFF;
        // Sprite tile 1 row 0: colour 2 everywhere.
        vram[16 + 1] = 0xFF;
        let sprites = [Sprite {
            y: 16,
            x: 8,
            tile: 1,
            flags: 0x80,
            oam_index: 0,
        }];
        let ctx = context(&vram, &sprites);
        let (out, _) = run_line(&mut Pipeline::new(0), &ctx);
        assert!(out[..8]
            .iter()
            .all(|px| px.source == PixelSource::Background { palette: 0 } && px.color == 1));
    }

    fn sprite(x: u8, flags: u8) -> Sprite {
        Sprite {
            y: 16,
            x,
            tile: 1,
            flags,
            oam_index: 0,
        }
    }

    fn object_columns(out: &[OutputPixel]) -> Vec<u8> {
        out.iter()
            .filter(|px| matches!(px.source, PixelSource::Object { .. }))
            .map(|px| px.x)
            .collect()
    }

    #[test]
    fn x_flip_mirrors_sprite_row() {
        let mut vram = vec![0u8; VRAM_BANK_SIZE * 2];
        // Tile 1 row 0: colour 1 in the leftmost column.
        vram[16] = 0x80;
        let plain = [sprite(8 + 20, 0)];
        let (out, _) = run_line(&mut Pipeline::new(0), &context(&vram, &plain));
        assert_eq!(object_columns(&out), vec![20]);

        let flipped = [sprite(8 + 20, 0x20)];
        let (out, _) = run_line(&mut Pipeline::new(0), &context(&vram, &flipped));
        assert_eq!(object_columns(&out), vec![27]);
    }

    #[test]
    fn y_flip_reads_rows_from_the_bottom() {
        let mut vram = vec![0u8; VRAM_BANK_SIZE * 2];
        // Tile 1 row 7 solid colour 2, row 0 empty.
        vram[16 + 7 * 2 + 1] = 0xFF;
        let plain = [sprite(8, 0)];
        let (out, _) = run_line(&mut Pipeline::new(0), &context(&vram, &plain));
        assert!(object_columns(&out).is_empty());

        let flipped = [sprite(8, 0x40)];
        let (out, _) = run_line(&mut Pipeline::new(0), &context(&vram, &flipped));
        assert_eq!(object_columns(&out), (0..8).collect::<Vec<u8>>());
        assert!(out[..8].iter().all(|px| px.color == 2));
    }

    #[test]
    fn shrinking_objects_mid_line_wraps_the_row() {
        let mut vram = vec![0u8; VRAM_BANK_SIZE * 2];
        // Tile 1 row 5 solid colour 1.
        vram[16 + 5 * 2] = 0xFF;
        // Picked as row 10 of an 8x16 object, drawn after LCDC.2 was cleared.
        let sprites = [sprite(8 + 20, 0x40)];
        let mut ctx = context(&vram, &sprites);
        ctx.ly = 10;
        ctx.lcdc = 0x93;
        let (out, _) = run_line(&mut Pipeline::new(0), &ctx);
        assert_eq!(object_columns(&out), (20..28).collect::<Vec<u8>>());
    }

    #[test]
    fn sprites_left_of_the_screen_are_clipped() {
        let mut vram = vec![0u8; VRAM_BANK_SIZE * 2];
        vram[16] = 0xFF;
        let sprites = [sprite(4, 0)];
        let (out, _) = run_line(&mut Pipeline::new(0), &context(&vram, &sprites));
        assert_eq!(out.len(), 160);
        assert_eq!(object_columns(&out), vec![0, 1, 2, 3]);
    }

    #[test]
    fn cgb_tile_priority_keeps_background_on_top() {
        let mut vram = vec![0u8; VRAM_BANK_SIZE * 2];
        // Background tile 0 row 0 colour 1; map column 0 has the priority bit.
        vram[0] = 0xFF;
        vram[VRAM_BANK_SIZE + BG_MAP_0] = 0x80;
        // Object tile 1 row 0 colour 2.
        vram[17] = 0xFF;
        let sprites = [sprite(8, 0), sprite(16, 0)];
        let mut ctx = context(&vram, &sprites);
        ctx.cgb = true;
        let (out, _) = run_line(&mut Pipeline::new(0), &ctx);
        assert_eq!(object_columns(&out), (8..16).collect::<Vec<u8>>());
        assert!(out[..8].iter().all(|px| px.color == 1));

        // LCDC.0 clear drops every background priority on CGB.
        ctx.lcdc = 0x92;
        let (out, _) = run_line(&mut Pipeline::new(0), &ctx);
        assert_eq!(object_columns(&out), (0..16).collect::<Vec<u8>>());
    }

    #[test]
    fn window_switches_fetch_source() {
        let mut vram = vec![0u8; VRAM_BANK_SIZE * 2];
        // Window map (0x9C00) uses tile 2, which is solid colour 3.
        for i in 0..32 {
            vram[BG_MAP_1 + i] = 2;
        }
        vram[32] = 0xFF;
        vram[33] = 0xFF;
        let mut ctx = context(&vram, &[]);
        ctx.lcdc = 0x93 | 0x20 | 0x40;
        ctx.wy_triggered = true;
        ctx.wx = 7 + 80;
        let mut p = Pipeline::new(0);
        let (out, _) = run_line(&mut p, &ctx);
        assert!(p.window_rendered());
        assert!(out[..80].iter().all(|px| px.color == 0));
        assert!(out[80..].iter().all(|px| px.color == 3));
    }
}
