// ZX Spectrum ULA source at layer 12: 256x192 bitmap with the Spectrum's
// interleaved line layout and 32x24 attribute map, scanned straight out
// of guest RAM at 0x4000. FLASH swaps ink and paper every 16 frames.

use crate::devices::{BusHandle, Device, MemoryRange};
use crate::memory::BusPtr;
use crate::mmio::{ULA_BASE, ULA_BORDER, ULA_CTRL, ULA_LIMIT, ULA_SCREEN_RAM};
use crate::video::{Frame, ScanlineAware, VideoSource};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub const LAYER: i32 = 12;
const WIDTH: usize = 256;
const HEIGHT: usize = 192;

// The Spectrum's dim/bright colour pairs.
fn colour(index: u8, bright: bool) -> [u8; 4] {
    let level = if bright { 0xFF } else { 0xD7 };
    let r = if index & 2 != 0 { level } else { 0 };
    let g = if index & 4 != 0 { level } else { 0 };
    let b = if index & 1 != 0 { level } else { 0 };
    [r, g, b, 255]
}

pub struct Ula {
    canvas: Mutex<Frame>,
    enabled: AtomicBool,
    border: AtomicU32,
    frames: AtomicU32,
    bus: BusHandle,
}

impl Ula {
    pub fn new() -> Arc<Ula> {
        Arc::new(Ula {
            canvas: Mutex::new(Frame::new(WIDTH, HEIGHT)),
            enabled: AtomicBool::new(false),
            border: AtomicU32::new(0),
            frames: AtomicU32::new(0),
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
        // Spectrum address interleave: bits of y scatter across the
        // bitmap address as y7 y6 | y2 y1 y0 | y5 y4 y3.
        let row_addr = ULA_SCREEN_RAM
            + (((y & 0xC0) << 5) | ((y & 0x07) << 8) | ((y & 0x38) << 2)) as u32;
        let flash_on = self.frames.load(Ordering::Relaxed) & 0x10 != 0;
        for col in 0..WIDTH / 8 {
            let bits = bus.read8(row_addr + col as u32);
            let attr = bus.read8(ULA_SCREEN_RAM + 0x1800 + ((y / 8) * 32 + col) as u32);
            let bright = attr & 0x40 != 0;
            let flash = attr & 0x80 != 0;
            let mut ink = colour(attr & 0x07, bright);
            let mut paper = colour((attr >> 3) & 0x07, bright);
            if flash && flash_on {
                std::mem::swap(&mut ink, &mut paper);
            }
            for bit in 0..8 {
                let set = bits & (0x80 >> bit) != 0;
                let at = (y * WIDTH + col * 8 + bit) * 4;
                canvas.pixels[at..at + 4].copy_from_slice(if set { &ink } else { &paper });
            }
        }
    }
}

impl Device for Ula {
    fn memconfig(&self) -> MemoryRange {
        vec![(ULA_BASE, ULA_LIMIT)]
    }
    fn read32(&self, addr: u32) -> u32 {
        match addr {
            ULA_BORDER => self.border.load(Ordering::Relaxed),
            ULA_CTRL => self.enabled.load(Ordering::Relaxed) as u32,
            _ => 0,
        }
    }
    fn write32(&self, addr: u32, value: u32) {
        match addr {
            ULA_BORDER => self.border.store(value & 7, Ordering::Relaxed),
            ULA_CTRL => self.enabled.store(value & 1 != 0, Ordering::Relaxed),
            _ => {}
        }
    }
}

impl VideoSource for Ula {
    fn name(&self) -> &'static str {
        "ula"
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
    fn signal_vsync(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }
    fn scanline(&self) -> Option<&dyn ScanlineAware> {
        Some(self)
    }
    fn reset(&self) {
        *self.canvas.lock().unwrap() = Frame::new(WIDTH, HEIGHT);
        self.enabled.store(false, Ordering::Release);
        self.border.store(0, Ordering::Relaxed);
        self.frames.store(0, Ordering::Relaxed);
    }
}

impl ScanlineAware for Ula {
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
    fn bitmap_and_attributes_render() {
        let bus = Bus::new();
        let ula = Ula::new();
        ula.connect(&bus);
        ula.set_enabled(true);
        // Top-left byte all ink, attribute white ink on black paper.
        bus.write8(ULA_SCREEN_RAM, 0xFF);
        bus.write8(ULA_SCREEN_RAM + 0x1800, 0x07);
        let frame = ula.frame().unwrap();
        assert_eq!(&frame.pixels[0..3], &[0xD7, 0xD7, 0xD7]);
        // Pixel row 1 of the same cell lives at +0x100, still paper.
        assert_eq!(frame.pixels[(WIDTH * 1) * 4], 0x00);
    }

    #[test]
    fn interleave_addresses_third_block() {
        // y = 64 starts the second third: address bit pattern 0x4800.
        let y = 64usize;
        let offset = ((y & 0xC0) << 5) | ((y & 0x07) << 8) | ((y & 0x38) << 2);
        assert_eq!(offset, 0x0800);
    }
}
