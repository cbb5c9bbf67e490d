// VGA source at layer 10: 80x25 text, Mode 13h, Mode 12h and ModeX,
// all rendered per scanline with whatever the palette holds at that
// moment, so copper writes targeting a later scanline land exactly
// there. Text and pixel memory live in guest RAM at the historical
// addresses; only the mode and palette registers are device state.

use crate::devices::{BusHandle, Device, MemoryRange};
use crate::memory::BusPtr;
use crate::mmio::*;
use crate::video::font;
use crate::video::{Frame, ScanlineAware, VideoSource};
use std::sync::Mutex;
use std::sync::Arc;

pub const LAYER: i32 = 10;

pub const MODE_OFF: u32 = 0;
pub const MODE_TEXT: u32 = 1;
pub const MODE_13H: u32 = 2;
pub const MODE_12H: u32 = 3;
pub const MODE_X: u32 = 4;

// EGA base colours seed the low palette; the rest starts as a grey ramp.
const EGA: [[u8; 3]; 16] = [
    [0x00, 0x00, 0x00],
    [0x00, 0x00, 0xAA],
    [0x00, 0xAA, 0x00],
    [0x00, 0xAA, 0xAA],
    [0xAA, 0x00, 0x00],
    [0xAA, 0x00, 0xAA],
    [0xAA, 0x55, 0x00],
    [0xAA, 0xAA, 0xAA],
    [0x55, 0x55, 0x55],
    [0x55, 0x55, 0xFF],
    [0x55, 0xFF, 0x55],
    [0x55, 0xFF, 0xFF],
    [0xFF, 0x55, 0x55],
    [0xFF, 0x55, 0xFF],
    [0xFF, 0xFF, 0x55],
    [0xFF, 0xFF, 0xFF],
];

struct VgaState {
    mode: u32,
    palette: [[u8; 4]; 256],
    pal_index: u8,
    canvas: Frame,
}

impl VgaState {
    fn new() -> VgaState {
        let mut palette = [[0u8; 4]; 256];
        for (i, rgb) in EGA.iter().enumerate() {
            palette[i] = [rgb[0], rgb[1], rgb[2], 255];
        }
        for i in 16..256 {
            let g = i as u8;
            palette[i] = [g, g, g, 255];
        }
        // Colour 0 composes transparent so lower layers show through.
        palette[0] = [0, 0, 0, 0];
        VgaState { mode: MODE_OFF, palette, pal_index: 0, canvas: Frame::new(640, 400) }
    }

    fn dims(&self) -> (usize, usize) {
        match self.mode {
            MODE_13H => (320, 200),
            MODE_12H => (640, 480),
            MODE_X => (320, 240),
            _ => (640, 400),
        }
    }
}

fn unpack_colour(value: u32) -> [u8; 4] {
    if value == 0 {
        return [0, 0, 0, 0];
    }
    let alpha = (value >> 24) as u8;
    [
        (value >> 16) as u8,
        (value >> 8) as u8,
        value as u8,
        if alpha == 0 { 255 } else { alpha },
    ]
}

pub struct Vga {
    state: Mutex<VgaState>,
    bus: BusHandle,
}

impl Vga {
    pub fn new() -> Arc<Vga> {
        Arc::new(Vga { state: Mutex::new(VgaState::new()), bus: BusHandle::new() })
    }

    pub fn connect(&self, bus: &BusPtr) {
        self.bus.connect(bus);
    }

    pub fn set_mode(&self, mode: u32) {
        let mut state = self.state.lock().unwrap();
        state.mode = mode.min(MODE_X);
        let (w, h) = state.dims();
        state.canvas = Frame::new(w, h);
    }

    fn render_scanline(&self, state: &mut VgaState, bus: &BusPtr, y: usize) {
        let (width, height) = state.dims();
        if y >= height {
            return;
        }
        match state.mode {
            MODE_TEXT => {
                let row = y / 16;
                let glyph_row = (y / 2) % font::GLYPH_HEIGHT;
                for col in 0..80 {
                    let cell = VGA_TEXT_RAM + 2 * (row * 80 + col) as u32;
                    let ch = bus.read8(cell);
                    let attr = bus.read8(cell + 1);
                    for x in 0..8 {
                        let lit = font::glyph(ch)[glyph_row] & (1 << x) != 0;
                        let index = if lit { attr & 0x0F } else { attr >> 4 };
                        let colour = state.palette[index as usize];
                        let at = (y * width + col * 8 + x) * 4;
                        state.canvas.pixels[at..at + 4].copy_from_slice(&colour);
                    }
                }
            }
            MODE_13H | MODE_X => {
                for x in 0..width {
                    let index = bus.read8(VGA_GFX_RAM + (y * width + x) as u32);
                    let colour = state.palette[index as usize];
                    let at = (y * width + x) * 4;
                    state.canvas.pixels[at..at + 4].copy_from_slice(&colour);
                }
            }
            MODE_12H => {
                // Simplified planar: two 4-bit pixels per byte.
                for x in 0..width {
                    let byte = bus.read8(VGA_GFX_RAM + ((y * width + x) / 2) as u32);
                    let index = if x & 1 == 0 { byte >> 4 } else { byte & 0x0F };
                    let colour = state.palette[index as usize];
                    let at = (y * width + x) * 4;
                    state.canvas.pixels[at..at + 4].copy_from_slice(&colour);
                }
            }
            _ => {}
        }
    }
}

impl Device for Vga {
    fn memconfig(&self) -> MemoryRange {
        vec![(VGA_BASE, VGA_LIMIT)]
    }

    fn read32(&self, addr: u32) -> u32 {
        let state = self.state.lock().unwrap();
        match addr {
            VGA_MODE_REG => state.mode,
            VGA_PAL_INDEX => state.pal_index as u32,
            addr if (VGA_PAL_BASE..=VGA_PAL_LIMIT).contains(&addr) => {
                let [r, g, b, a] = state.palette[((addr - VGA_PAL_BASE) / 4) as usize];
                ((a as u32) << 24) | ((r as u32) << 16) | ((g as u32) << 8) | b as u32
            }
            _ => 0,
        }
    }

    fn write32(&self, addr: u32, value: u32) {
        match addr {
            VGA_MODE_REG => self.set_mode(value),
            VGA_PAL_INDEX => self.state.lock().unwrap().pal_index = value as u8,
            VGA_PAL_DATA => {
                let mut state = self.state.lock().unwrap();
                let index = state.pal_index as usize;
                state.palette[index] = unpack_colour(value);
                state.pal_index = state.pal_index.wrapping_add(1);
            }
            addr if (VGA_PAL_BASE..=VGA_PAL_LIMIT).contains(&addr) => {
                let mut state = self.state.lock().unwrap();
                state.palette[((addr - VGA_PAL_BASE) / 4) as usize] = unpack_colour(value);
            }
            _ => {}
        }
    }
}

impl VideoSource for Vga {
    fn name(&self) -> &'static str {
        "vga"
    }
    fn enabled(&self) -> bool {
        self.state.lock().unwrap().mode != MODE_OFF
    }
    fn layer(&self) -> i32 {
        LAYER
    }
    fn dimensions(&self) -> (usize, usize) {
        self.state.lock().unwrap().dims()
    }
    fn frame(&self) -> Option<Frame> {
        let bus = self.bus.get()?;
        let mut state = self.state.lock().unwrap();
        if state.mode == MODE_OFF {
            return None;
        }
        let (_, height) = state.dims();
        for y in 0..height {
            self.render_scanline(&mut state, &bus, y);
        }
        Some(state.canvas.clone())
    }
    fn signal_vsync(&self) {}
    fn scanline(&self) -> Option<&dyn ScanlineAware> {
        Some(self)
    }
    fn reset(&self) {
        *self.state.lock().unwrap() = VgaState::new();
    }
}

impl ScanlineAware for Vga {
    fn start_frame(&self) {}

    fn process_scanline(&self, y: usize) {
        let Some(bus) = self.bus.get() else { return };
        let mut state = self.state.lock().unwrap();
        if state.mode != MODE_OFF {
            self.render_scanline(&mut state, &bus, y);
        }
    }

    fn finish_frame(&self) -> Option<Frame> {
        let state = self.state.lock().unwrap();
        if state.mode == MODE_OFF {
            return None;
        }
        Some(state.canvas.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Bus;

    #[test]
    fn text_cell_renders_with_palette() {
        let bus = Bus::new();
        let vga = Vga::new();
        vga.connect(&bus);
        bus.attach(vga.clone() as Arc<dyn Device>);
        bus.write32(VGA_MODE_REG, MODE_TEXT);
        // 'A' white-on-black at the top-left cell.
        bus.write8(VGA_TEXT_RAM, b'A');
        bus.write8(VGA_TEXT_RAM + 1, 0x0F);
        let frame = vga.frame().unwrap();
        // Row 2 of the glyph has set pixels; find a lit one.
        let mut lit = false;
        for x in 0..8 {
            let at = (2 * 640 + x) * 4;
            if frame.pixels[at] == 0xFF {
                lit = true;
            }
        }
        assert!(lit, "glyph pixels must use the foreground colour");
    }

    #[test]
    fn palette_window_updates_colour() {
        let bus = Bus::new();
        let vga = Vga::new();
        vga.connect(&bus);
        bus.attach(vga.clone() as Arc<dyn Device>);
        bus.write32(VGA_PAL_BASE + 4, 0x00FF_0000); // palette 1 = red
        let word = bus.read32(VGA_PAL_BASE + 4);
        assert_eq!(word & 0x00FF_FFFF, 0x00FF_0000);
        assert_eq!(word >> 24, 255, "implied opaque alpha");
    }

    #[test]
    fn mode_13h_uses_gfx_ram() {
        let bus = Bus::new();
        let vga = Vga::new();
        vga.connect(&bus);
        bus.attach(vga.clone() as Arc<dyn Device>);
        bus.write32(VGA_MODE_REG, MODE_13H);
        bus.write8(VGA_GFX_RAM, 15); // white
        let frame = vga.frame().unwrap();
        assert_eq!(frame.width, 320);
        assert_eq!(&frame.pixels[0..3], &[0xFF, 0xFF, 0xFF]);
    }
}
