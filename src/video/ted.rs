// Plus/4 TED video source at layer 13: 40x25 character matrix with a
// colour matrix, rendered from guest RAM. Colours come from the TED's
// luminance/chroma scheme, approximated over 16 hues and 8 luma steps.

use crate::devices::{BusHandle, Device, MemoryRange};
use crate::memory::BusPtr;
use crate::mmio::*;
use crate::video::font;
use crate::video::{Frame, ScanlineAware, VideoSource};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub const LAYER: i32 = 13;
const WIDTH: usize = 320;
const HEIGHT: usize = 200;

// Hue table for the TED's 16 chroma values at mid luminance.
const HUES: [[u8; 3]; 16] = [
    [0, 0, 0],
    [128, 128, 128],
    [160, 32, 32],
    [32, 160, 160],
    [160, 32, 160],
    [32, 160, 32],
    [32, 32, 160],
    [160, 160, 32],
    [160, 96, 32],
    [128, 112, 32],
    [96, 160, 32],
    [160, 32, 96],
    [32, 160, 96],
    [32, 96, 160],
    [96, 32, 160],
    [160, 32, 32],
];

/// TED colour byte: low nibble chroma, bits 4-6 luminance.
fn ted_colour(value: u8) -> [u8; 4] {
    let hue = HUES[(value & 0x0F) as usize];
    let luma = ((value >> 4) & 0x07) as u16;
    let scale = |c: u8| -> u8 { ((c as u16 * (luma + 3)) / 10).min(255) as u8 };
    if value & 0x0F == 0 {
        let level = (luma * 32) as u8;
        return [level, level, level, 255];
    }
    [scale(hue[0]), scale(hue[1]), scale(hue[2]), 255]
}

struct TedRegs {
    bg: u8,
    border: u8,
    matrix: u32,
    chargen: u32,
    colour: u32,
}

pub struct TedVideo {
    canvas: Mutex<Frame>,
    regs: Mutex<TedRegs>,
    enabled: AtomicBool,
    bus: BusHandle,
}

impl TedVideo {
    pub fn new() -> Arc<TedVideo> {
        Arc::new(TedVideo {
            canvas: Mutex::new(Frame::new(WIDTH, HEIGHT)),
            regs: Mutex::new(TedRegs { bg: 0, border: 0, matrix: 0x0C00, chargen: 0, colour: 0x0800 }),
            enabled: AtomicBool::new(false),
            bus: BusHandle::new(),
        })
    }

    pub fn connect(&self, bus: &BusPtr) {
        self.bus.connect(bus);
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Release);
    }

    fn render_line(&self, bus: &BusPtr, y: usize, canvas: &mut Frame) {
        let regs = self.regs.lock().unwrap();
        let row = y / 8;
        let glyph_row = y % 8;
        let bg = ted_colour(regs.bg);
        for col in 0..WIDTH / 8 {
            let code = bus.read8(regs.matrix + (row * 40 + col) as u32);
            let colour_byte = bus.read8(regs.colour + (row * 40 + col) as u32);
            let fg = ted_colour(colour_byte);
            // A chargen of zero falls back to the built-in glyphs.
            let bits = if regs.chargen == 0 {
                font::glyph(code)[glyph_row]
            } else {
                bus.read8(regs.chargen + (code as usize * 8 + glyph_row) as u32)
            };
            for bit in 0..8 {
                let set = bits & (1 << bit) != 0;
                let at = (y * WIDTH + col * 8 + bit) * 4;
                canvas.pixels[at..at + 4].copy_from_slice(if set { &fg } else { &bg });
            }
        }
    }
}

impl Device for TedVideo {
    fn memconfig(&self) -> MemoryRange {
        vec![(TED_VIDEO_BASE, TED_VIDEO_LIMIT)]
    }
    fn read32(&self, addr: u32) -> u32 {
        let regs = self.regs.lock().unwrap();
        match addr {
            TEDV_CTRL => self.enabled.load(Ordering::Relaxed) as u32,
            TEDV_BG => regs.bg as u32,
            TEDV_BORDER => regs.border as u32,
            TEDV_MATRIX => regs.matrix,
            TEDV_CHARGEN => regs.chargen,
            TEDV_COLOR => regs.colour,
            _ => 0,
        }
    }
    fn write32(&self, addr: u32, value: u32) {
        let mut regs = self.regs.lock().unwrap();
        match addr {
            TEDV_CTRL => self.enabled.store(value & 1 != 0, Ordering::Relaxed),
            TEDV_BG => regs.bg = value as u8,
            TEDV_BORDER => regs.border = value as u8,
            TEDV_MATRIX => regs.matrix = value,
            TEDV_CHARGEN => regs.chargen = value,
            TEDV_COLOR => regs.colour = value,
            _ => {}
        }
    }
}

impl VideoSource for TedVideo {
    fn name(&self) -> &'static str {
        "ted-video"
    }
    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
    fn layer(&self) -> i32 {
        LAYER
    }
    fn dimensions(&self) -> (usize, usize) {
        (WIDTH, HEIGHT)
    }
    fn frame(&self) -> Option<Frame> {
        let bus = self.bus.get()?;
        let mut canvas = self.canvas.lock().unwrap();
        for y in 0..HEIGHT {
            self.render_line(&bus, y, &mut canvas);
        }
        Some(canvas.clone())
    }
    fn signal_vsync(&self) {}
    fn scanline(&self) -> Option<&dyn ScanlineAware> {
        Some(self)
    }
    fn reset(&self) {
        *self.canvas.lock().unwrap() = Frame::new(WIDTH, HEIGHT);
        *self.regs.lock().unwrap() =
            TedRegs { bg: 0, border: 0, matrix: 0x0C00, chargen: 0, colour: 0x0800 };
        self.enabled.store(false, Ordering::Release);
    }
}

impl ScanlineAware for TedVideo {
    fn start_frame(&self) {}
    fn process_scanline(&self, y: usize) {
        if y >= HEIGHT {
            return;
        }
        let Some(bus) = self.bus.get() else { return };
        let mut canvas = self.canvas.lock().unwrap();
        self.render_line(&bus, y, &mut canvas);
    }
    fn finish_frame(&self) -> Option<Frame> {
        Some(self.canvas.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Bus;

    #[test]
    fn character_matrix_renders_glyphs() {
        let bus = Bus::new();
        let ted = TedVideo::new();
        ted.connect(&bus);
        ted.set_enabled(true);
        bus.write8(0x0C00, b'#');
        bus.write8(0x0800, 0x71); // bright white-ish foreground
        let frame = ted.frame().unwrap();
        // '#' row 1 has bits 1,2,4,5 set.
        let lit = (1..6).any(|x| frame.pixels[(WIDTH + x) * 4] > 0);
        assert!(lit);
    }

    #[test]
    fn luminance_scales_grey() {
        let dark = ted_colour(0x00);
        let bright = ted_colour(0x70);
        assert!(bright[0] > dark[0]);
    }
}
