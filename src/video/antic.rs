// Atari ANTIC/GTIA source at layer 14. ANTIC walks a display list in
// guest RAM (blank lines, mode 2 text, mode 8/15 bitmap rows, LMS loads
// and the JVB terminator); GTIA's colour registers pick the palette.
// The list is re-walked every frame, one scanline at a time.

use crate::devices::{BusHandle, Device, MemoryRange};
use crate::memory::BusPtr;
use crate::mmio::*;
use crate::video::font;
use crate::video::{Frame, ScanlineAware, VideoSource};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub const LAYER: i32 = 14;
const WIDTH: usize = 320;
const HEIGHT: usize = 192;

/// Atari colour byte to RGB: hue in the high nibble, luminance in the
/// low. A compact approximation of the GTIA's PAL output.
fn gtia_colour(value: u8) -> [u8; 4] {
    let hue = (value >> 4) as f32;
    let luma = (value & 0x0F) as f32 / 15.0;
    if value >> 4 == 0 {
        let level = (luma * 255.0) as u8;
        return [level, level, level, 255];
    }
    let angle = (hue - 1.0) / 15.0 * std::f32::consts::TAU;
    let base = 0.35 + 0.65 * luma;
    let r = (base * (0.6 + 0.4 * angle.cos()) * 255.0).min(255.0) as u8;
    let g = (base * (0.6 + 0.4 * (angle - 2.1).cos()) * 255.0).min(255.0) as u8;
    let b = (base * (0.6 + 0.4 * (angle + 2.1).cos()) * 255.0).min(255.0) as u8;
    [r, g, b, 255]
}

// Walker state for one frame of display-list interpretation.
struct Walk {
    dlist: u32,
    memscan: u32,
    // Remaining scanlines and kind of the current display-list row.
    rows_left: usize,
    mode: u8,
    row: usize,
    done: bool,
}

impl Walk {
    fn new() -> Walk {
        Walk { dlist: 0, memscan: 0, rows_left: 0, mode: 0, row: 0, done: true }
    }
}

pub struct Antic {
    canvas: Mutex<Frame>,
    walk: Mutex<Walk>,
    enabled: AtomicBool,
    dlist: AtomicU32,
    chbase: AtomicU32,
    colbk: AtomicU32,
    colpf: [AtomicU32; 4],
    bus: BusHandle,
}

impl Antic {
    pub fn new() -> Arc<Antic> {
        Arc::new(Antic {
            canvas: Mutex::new(Frame::new(WIDTH, HEIGHT)),
            walk: Mutex::new(Walk::new()),
            enabled: AtomicBool::new(false),
            dlist: AtomicU32::new(0),
            chbase: AtomicU32::new(0),
            colbk: AtomicU32::new(0),
            colpf: std::array::from_fn(|_| AtomicU32::new(0x0F)),
            bus: BusHandle::new(),
        })
    }

    pub fn connect(&self, bus: &BusPtr) {
        self.bus.connect(bus);
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Release);
    }

    fn fetch_instruction(&self, bus: &BusPtr, walk: &mut Walk) {
        loop {
            if walk.done {
                return;
            }
            let op = bus.read8(walk.dlist);
            walk.dlist += 1;
            if op == 0x41 {
                // JVB: end of list.
                walk.done = true;
                return;
            }
            if op & 0x0F == 0 {
                // 1..8 blank lines.
                walk.mode = 0;
                walk.rows_left = (((op >> 4) & 7) + 1) as usize;
                walk.row = 0;
                return;
            }
            if op & 0x40 != 0 {
                // LMS: next two bytes load the memory scan counter.
                let lo = bus.read8(walk.dlist) as u32;
                let hi = bus.read8(walk.dlist + 1) as u32;
                walk.dlist += 2;
                walk.memscan = lo | (hi << 8);
            }
            walk.mode = op & 0x0F;
            walk.row = 0;
            walk.rows_left = match walk.mode {
                2 => 8,  // text row
                8 => 1,  // coarse bitmap
                15 => 1, // hi-res bitmap
                _ => 1,
            };
            return;
        }
    }

    fn render_line(&self, bus: &BusPtr, y: usize, canvas: &mut Frame) {
        let mut walk = self.walk.lock().unwrap();
        if walk.rows_left == 0 && !walk.done {
            self.fetch_instruction(bus, &mut walk);
        }
        let background = gtia_colour(self.colbk.load(Ordering::Relaxed) as u8);
        let text_colour = gtia_colour(self.colpf[1].load(Ordering::Relaxed) as u8);
        let pf0 = gtia_colour(self.colpf[0].load(Ordering::Relaxed) as u8);

        let row_pixels = &mut canvas.pixels[y * WIDTH * 4..(y + 1) * WIDTH * 4];
        match (walk.done, walk.mode) {
            (true, _) | (false, 0) => {
                for px in row_pixels.chunks_exact_mut(4) {
                    px.copy_from_slice(&background);
                }
            }
            (false, 2) => {
                let chbase = self.chbase.load(Ordering::Relaxed);
                for col in 0..40 {
                    let code = bus.read8(walk.memscan + col as u32);
                    let bits = if chbase == 0 {
                        font::glyph(code)[walk.row & 7]
                    } else {
                        bus.read8(chbase + (code as usize * 8 + (walk.row & 7)) as u32)
                    };
                    for bit in 0..8 {
                        let set = bits & (1 << bit) != 0;
                        let at = (col * 8 + bit) * 4;
                        row_pixels[at..at + 4]
                            .copy_from_slice(if set { &text_colour } else { &background });
                    }
                }
            }
            (false, _) => {
                // Bitmap rows: one bit per pixel at full width.
                for col in 0..WIDTH / 8 {
                    let bits = bus.read8(walk.memscan + col as u32);
                    for bit in 0..8 {
                        let set = bits & (0x80 >> bit) != 0;
                        let at = (col * 8 + bit) * 4;
                        row_pixels[at..at + 4]
                            .copy_from_slice(if set { &pf0 } else { &background });
                    }
                }
            }
        }

        walk.row += 1;
        if walk.rows_left > 0 {
            walk.rows_left -= 1;
            if walk.rows_left == 0 && walk.mode != 0 {
                // Advance the memory scan past the consumed row data.
                walk.memscan += if walk.mode == 2 { 40 } else { 40 };
            }
        }
    }
}

impl Device for Antic {
    fn memconfig(&self) -> MemoryRange {
        vec![(ANTIC_BASE, ANTIC_LIMIT)]
    }
    fn read32(&self, addr: u32) -> u32 {
        match addr {
            ANTIC_DLIST => self.dlist.load(Ordering::Relaxed),
            ANTIC_CHBASE => self.chbase.load(Ordering::Relaxed),
            ANTIC_CTRL => self.enabled.load(Ordering::Relaxed) as u32,
            GTIA_COLBK => self.colbk.load(Ordering::Relaxed),
            GTIA_COLPF0 => self.colpf[0].load(Ordering::Relaxed),
            GTIA_COLPF1 => self.colpf[1].load(Ordering::Relaxed),
            GTIA_COLPF2 => self.colpf[2].load(Ordering::Relaxed),
            GTIA_COLPF3 => self.colpf[3].load(Ordering::Relaxed),
            _ => 0,
        }
    }
    fn write32(&self, addr: u32, value: u32) {
        match addr {
            ANTIC_DLIST => self.dlist.store(value, Ordering::Relaxed),
            ANTIC_CHBASE => self.chbase.store(value, Ordering::Relaxed),
            ANTIC_CTRL => self.enabled.store(value & 1 != 0, Ordering::Relaxed),
            GTIA_COLBK => self.colbk.store(value, Ordering::Relaxed),
            GTIA_COLPF0 => self.colpf[0].store(value, Ordering::Relaxed),
            GTIA_COLPF1 => self.colpf[1].store(value, Ordering::Relaxed),
            GTIA_COLPF2 => self.colpf[2].store(value, Ordering::Relaxed),
            GTIA_COLPF3 => self.colpf[3].store(value, Ordering::Relaxed),
            _ => {}
        }
    }
}

impl VideoSource for Antic {
    fn name(&self) -> &'static str {
        "antic"
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
        self.start_frame();
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
        *self.walk.lock().unwrap() = Walk::new();
        self.enabled.store(false, Ordering::Release);
        self.dlist.store(0, Ordering::Relaxed);
        self.chbase.store(0, Ordering::Relaxed);
    }
}

impl ScanlineAware for Antic {
    fn start_frame(&self) {
        let mut walk = self.walk.lock().unwrap();
        walk.dlist = self.dlist.load(Ordering::Relaxed);
        walk.memscan = 0;
        walk.rows_left = 0;
        walk.mode = 0;
        walk.row = 0;
        walk.done = walk.dlist == 0;
    }
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
    fn display_list_text_row() {
        let bus = Bus::new();
        let antic = Antic::new();
        antic.connect(&bus);
        antic.set_enabled(true);
        bus.attach(antic.clone() as Arc<dyn Device>);
        // List at 0x3000: mode 2 with LMS -> 0x3800, then JVB.
        bus.write8(0x3000, 0x42);
        bus.write8(0x3001, 0x00);
        bus.write8(0x3002, 0x38);
        bus.write8(0x3003, 0x41);
        bus.write8(0x3800, b'H');
        bus.write32(ANTIC_DLIST, 0x3000);
        let frame = antic.frame().unwrap();
        // 'H' row 0 has bit 0 lit (default COLPF1 renders white) and
        // bit 2 dark background.
        assert_eq!(frame.pixels[0], 0xFF);
        assert_eq!(frame.pixels[2 * 4], 0x00);
    }

    #[test]
    fn jvb_ends_list_with_background() {
        let bus = Bus::new();
        let antic = Antic::new();
        antic.connect(&bus);
        antic.set_enabled(true);
        bus.attach(antic.clone() as Arc<dyn Device>);
        bus.write8(0x3000, 0x41); // immediate JVB
        bus.write32(ANTIC_DLIST, 0x3000);
        antic.write32(GTIA_COLBK, 0x06); // dark grey
        let frame = antic.frame().unwrap();
        let level = frame.pixels[0];
        assert!(frame.pixels.chunks_exact(4).all(|px| px[0] == level));
    }
}
