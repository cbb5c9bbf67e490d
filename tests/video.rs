// Compositor contract tests: the copper-before-VGA scanline ordering,
// layer ordering across sources, and VSync edge semantics.

use intuition_engine::devices::Device;
use intuition_engine::memory::Bus;
use intuition_engine::mmio::*;
use intuition_engine::video::framebuffer::FramebufferChip;
use intuition_engine::video::vga::{Vga, MODE_TEXT};
use intuition_engine::video::{Compositor, Frame, ScanlineAware, VideoSource};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const COP_WAIT: u32 = 1;
const COP_MOVE: u32 = 2;

#[test]
fn copper_retargets_vga_palette_on_its_scanline() {
    let bus = Bus::new();
    let compositor = Compositor::new();

    let framebuffer = FramebufferChip::new(compositor.status_cell());
    framebuffer.connect(&bus);
    bus.attach(framebuffer.clone() as Arc<dyn Device>);
    framebuffer.set_enabled(true);

    let vga = Vga::new();
    vga.connect(&bus);
    bus.attach(vga.clone() as Arc<dyn Device>);
    bus.write32(VGA_MODE_REG, MODE_TEXT);

    compositor.register(framebuffer.clone() as Arc<dyn VideoSource>);
    compositor.register(vga.clone() as Arc<dyn VideoSource>);

    // Fill the text page with attribute 0 cells: every pixel of every
    // cell renders palette entry 0, which starts out transparent.
    for cell in 0..80 * 25u32 {
        bus.write16(VGA_TEXT_RAM + cell * 2, u16::from_le_bytes([b' ', 0x00]));
    }

    // Copper: at scanline 100, palette entry 0 becomes red.
    bus.write32(COPPER_PROG, (COP_WAIT << 28) | 100);
    bus.write32(COPPER_PROG + 4, 0);
    bus.write32(COPPER_PROG + 8, (COP_MOVE << 28) | VGA_PAL_BASE);
    bus.write32(COPPER_PROG + 12, 0x00FF_0000);
    bus.write32(COPPER_CTRL, 1);

    compositor.composite_once();

    let (width, height, pixels) = compositor.front().take().expect("frame published");
    assert_eq!((width, height), (640, 480));
    // The VGA's 400 rows centre over the 480-row canvas.
    let offset_y = (480 - 400) / 2;

    // Every pixel of the scanline the copper targeted is red.
    let row = (100 + offset_y) * width;
    for x in 0..width {
        let px = pixels[row + x];
        assert_eq!(px & 0x00FF_FFFF, 0x00FF_0000, "pixel {x} of the target row");
    }
    // A row above the WAIT line still shows the transparent palette
    // over the framebuffer's black.
    let earlier = (60 + offset_y) * width;
    assert_eq!(pixels[earlier] & 0x00FF_FFFF, 0);
}

// A probe source that records the order every scanline visit happens in.
struct Probe {
    layer: i32,
    log: Arc<Mutex<Vec<(i32, usize)>>>,
    vsyncs: AtomicUsize,
}

impl Probe {
    fn new(layer: i32, log: Arc<Mutex<Vec<(i32, usize)>>>) -> Arc<Probe> {
        Arc::new(Probe { layer, log, vsyncs: AtomicUsize::new(0) })
    }
}

impl VideoSource for Probe {
    fn name(&self) -> &'static str {
        "probe"
    }
    fn enabled(&self) -> bool {
        true
    }
    fn layer(&self) -> i32 {
        self.layer
    }
    fn dimensions(&self) -> (usize, usize) {
        (8, 4)
    }
    fn frame(&self) -> Option<Frame> {
        Some(Frame::new(8, 4))
    }
    fn signal_vsync(&self) {
        self.vsyncs.fetch_add(1, Ordering::SeqCst);
    }
    fn scanline(&self) -> Option<&dyn ScanlineAware> {
        Some(self)
    }
    fn reset(&self) {}
}

impl ScanlineAware for Probe {
    fn start_frame(&self) {}
    fn process_scanline(&self, y: usize) {
        self.log.lock().unwrap().push((self.layer, y));
    }
    fn finish_frame(&self) -> Option<Frame> {
        Some(Frame::new(8, 4))
    }
}

#[test]
fn scanline_order_is_ascending_by_layer_for_every_row() {
    let compositor = Compositor::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let high = Probe::new(10, Arc::clone(&log));
    let low = Probe::new(0, Arc::clone(&log));
    // Register high first to prove sorting is by layer, not order.
    compositor.register(high.clone() as Arc<dyn VideoSource>);
    compositor.register(low.clone() as Arc<dyn VideoSource>);

    compositor.composite_once();

    let entries = log.lock().unwrap();
    for y in 0..4 {
        let row: Vec<i32> = entries
            .iter()
            .filter(|(_, line)| *line == y)
            .map(|(layer, _)| *layer)
            .collect();
        assert_eq!(row, vec![0, 10], "row {y} must visit low layer first");
    }
    assert_eq!(high.vsyncs.load(Ordering::SeqCst), 1);
    assert_eq!(low.vsyncs.load(Ordering::SeqCst), 1);
}

#[test]
fn vblank_status_bit_rises_after_composite() {
    let compositor = Compositor::new();
    let status = compositor.status_cell();
    assert_eq!(status.load(Ordering::Acquire) & VIDEO_STATUS_VBLANK, 0);
    compositor.composite_once();
    assert_eq!(
        status.load(Ordering::Acquire) & VIDEO_STATUS_VBLANK,
        VIDEO_STATUS_VBLANK
    );
}

#[test]
fn mixed_capability_sources_fall_back_to_frame_path() {
    struct FrameOnly;
    impl VideoSource for FrameOnly {
        fn name(&self) -> &'static str {
            "frame-only"
        }
        fn enabled(&self) -> bool {
            true
        }
        fn layer(&self) -> i32 {
            20
        }
        fn dimensions(&self) -> (usize, usize) {
            (8, 4)
        }
        fn frame(&self) -> Option<Frame> {
            let mut frame = Frame::new(8, 4);
            for px in frame.pixels.chunks_exact_mut(4) {
                px.copy_from_slice(&[0, 0, 200, 255]);
            }
            Some(frame)
        }
        fn signal_vsync(&self) {}
        fn reset(&self) {}
    }

    let compositor = Compositor::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let scanliner = Probe::new(0, Arc::clone(&log));
    compositor.register(scanliner as Arc<dyn VideoSource>);
    compositor.register(Arc::new(FrameOnly) as Arc<dyn VideoSource>);

    compositor.composite_once();
    assert!(
        log.lock().unwrap().is_empty(),
        "one frame-only source forces the whole tick onto the frame path"
    );
    let (_, _, pixels) = compositor.front().take().unwrap();
    assert_eq!(pixels[0] & 0xFF, 200, "frame-only source still composes");
}

#[test]
fn framebuffer_status_register_carries_vblank() {
    let bus = Bus::new();
    let status = Arc::new(AtomicU32::new(0));
    let framebuffer = FramebufferChip::new(Arc::clone(&status));
    framebuffer.connect(&bus);
    bus.attach(framebuffer as Arc<dyn Device>);
    assert_eq!(bus.read32(FB_STATUS) & VIDEO_STATUS_VBLANK, 0);
    status.store(VIDEO_STATUS_VBLANK, Ordering::Release);
    assert_eq!(bus.read32(FB_STATUS) & VIDEO_STATUS_VBLANK, VIDEO_STATUS_VBLANK);
}
