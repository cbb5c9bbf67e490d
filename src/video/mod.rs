// The video compositor and the source contracts. Sources register with
// a z-order layer; every 1/60 s the compositor gathers frames and blends
// them bottom-up. When every enabled source can render scanline-by-
// scanline the compositor drives them all a row at a time instead, which
// is what lets the framebuffer chip's copper retarget another chip's
// registers mid-frame.

pub mod antic;
pub mod font;
pub mod framebuffer;
pub mod ted;
pub mod ula;
pub mod vga;
pub mod voodoo;

use crate::devices::{Device, MemoryRange};
use crate::mmio::{VIDEO_BASE, VIDEO_CTRL, VIDEO_HEIGHT, VIDEO_LIMIT, VIDEO_STATUS, VIDEO_STATUS_VBLANK, VIDEO_WIDTH};
use crate::processor::{InterruptLine, IRQ_VBLANK};
use crossbeam_channel::{bounded, select, tick, Sender};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// One produced frame: RGBA bytes, little-endian packed, alpha high.
#[derive(Clone)]
pub struct Frame {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn new(width: usize, height: usize) -> Frame {
        Frame { width, height, pixels: vec![0; width * height * 4] }
    }
}

pub trait VideoSource: Send + Sync {
    fn name(&self) -> &'static str;
    fn enabled(&self) -> bool;
    /// Z-order; higher layers draw on top.
    fn layer(&self) -> i32;
    fn dimensions(&self) -> (usize, usize);
    /// Latest complete frame, or None when nothing new is ready.
    fn frame(&self) -> Option<Frame>;
    /// Edge-triggered, exactly once per composite that consumed a frame.
    fn signal_vsync(&self);
    fn reset(&self);

    /// Sources that declare alpha get true blending; everyone else is
    /// treated as opaque wherever alpha is non-zero.
    fn alpha_capable(&self) -> bool {
        false
    }
    fn scanline(&self) -> Option<&dyn ScanlineAware> {
        None
    }
    /// Compositor-managed quiescence for sources with render threads.
    fn set_managed(&self, _managed: bool) {}
    fn render_idle(&self) -> bool {
        true
    }
    /// Display-endianness hint; only the framebuffer chip cares.
    fn set_big_endian(&self, _on: bool) {}
}

/// The row-at-a-time contract. `process_scanline` is called for every
/// source in ascending layer order before y advances.
pub trait ScanlineAware {
    fn start_frame(&self);
    fn process_scanline(&self, y: usize);
    fn finish_frame(&self) -> Option<Frame>;
}

/// Where composed frames go; pumped by the host display loop.
pub struct FrontBuffer {
    pub pixels: Mutex<Vec<u32>>,
    pub width: AtomicUsize,
    pub height: AtomicUsize,
    pub fresh: AtomicBool,
}

impl FrontBuffer {
    fn new() -> Arc<FrontBuffer> {
        Arc::new(FrontBuffer {
            pixels: Mutex::new(vec![0; 640 * 480]),
            width: AtomicUsize::new(640),
            height: AtomicUsize::new(480),
            fresh: AtomicBool::new(false),
        })
    }

    /// Grab the latest composed frame as 0RGB words if one is pending.
    pub fn take(&self) -> Option<(usize, usize, Vec<u32>)> {
        if !self.fresh.swap(false, Ordering::AcqRel) {
            return None;
        }
        let pixels = self.pixels.lock().unwrap().clone();
        Some((
            self.width.load(Ordering::Acquire),
            self.height.load(Ordering::Acquire),
            pixels,
        ))
    }
}

struct Core {
    accumulator: Frame,
    // Last frame each source produced, reused when a tick yields None so
    // the screen never flickers.
    cached: Vec<Option<Frame>>,
}

pub struct Compositor {
    sources: Mutex<Vec<Arc<dyn VideoSource>>>,
    core: Mutex<Core>,
    front: Arc<FrontBuffer>,
    status: Arc<AtomicU32>,
    enabled: AtomicBool,
    running: Arc<AtomicBool>,
    stop_tx: Mutex<Option<Sender<()>>>,
    frames: AtomicU32,
    irq: Mutex<Option<Arc<InterruptLine>>>,
}

impl Compositor {
    pub fn new() -> Arc<Compositor> {
        Arc::new(Compositor {
            sources: Mutex::new(Vec::new()),
            core: Mutex::new(Core { accumulator: Frame::new(640, 480), cached: Vec::new() }),
            front: FrontBuffer::new(),
            status: Arc::new(AtomicU32::new(0)),
            enabled: AtomicBool::new(true),
            running: Arc::new(AtomicBool::new(false)),
            stop_tx: Mutex::new(None),
            frames: AtomicU32::new(0),
            irq: Mutex::new(None),
        })
    }

    /// VBlank interrupts for cores that take them.
    pub fn set_irq(&self, irq: Arc<InterruptLine>) {
        *self.irq.lock().unwrap() = Some(irq);
    }

    /// Sources are kept sorted by ascending layer from registration on;
    /// composite order never has to sort again.
    pub fn register(&self, source: Arc<dyn VideoSource>) {
        let mut sources = self.sources.lock().unwrap();
        let layer = source.layer();
        let at = sources.partition_point(|s| s.layer() <= layer);
        sources.insert(at, source);
        self.core.lock().unwrap().cached = vec![None; sources.len()];
    }

    pub fn front(&self) -> Arc<FrontBuffer> {
        Arc::clone(&self.front)
    }

    /// The VBlank status word the bus exposes through its lock-free
    /// reader path.
    pub fn status_cell(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.status)
    }

    pub fn reset(&self) {
        let mut core = self.core.lock().unwrap();
        core.accumulator = Frame::new(640, 480);
        for slot in core.cached.iter_mut() {
            *slot = None;
        }
        self.status.store(0, Ordering::Release);
        self.frames.store(0, Ordering::Release);
    }

    /// Spawn the 60 Hz tick thread.
    pub fn start(self: &Arc<Compositor>) -> CompositorHandle {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        *self.stop_tx.lock().unwrap() = Some(stop_tx);
        self.running.store(true, Ordering::Release);
        let compositor = Arc::clone(self);
        let running = Arc::clone(&self.running);
        let handle = std::thread::Builder::new()
            .name("compositor".into())
            .spawn(move || {
                let cadence = tick(Duration::from_micros(16_667));
                while running.load(Ordering::Acquire) {
                    select! {
                        recv(cadence) -> _ => compositor.composite_once(),
                        recv(stop_rx) -> _ => break,
                    }
                }
            })
            .expect("spawning the compositor thread cannot fail on a healthy host");
        CompositorHandle { running: Arc::clone(&self.running), handle: Some(handle) }
    }

    /// One full composite tick. Public so tests and the handle-less
    /// headless path can drive it deterministically.
    pub fn composite_once(&self) {
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }
        self.status.store(0, Ordering::Release);
        let sources: Vec<(usize, Arc<dyn VideoSource>)> = {
            let all = self.sources.lock().unwrap();
            all.iter()
                .enumerate()
                .filter(|(_, s)| s.enabled())
                .map(|(i, s)| (i, Arc::clone(s)))
                .collect()
        };

        let mut core = self.core.lock().unwrap();

        // Resolution negotiation: the largest requested size wins.
        let mut width = 0;
        let mut height = 0;
        for (_, source) in &sources {
            let (w, h) = source.dimensions();
            width = width.max(w);
            height = height.max(h);
        }
        if width == 0 || height == 0 {
            width = 640;
            height = 480;
        }
        if core.accumulator.width != width || core.accumulator.height != height {
            core.accumulator = Frame::new(width, height);
        }

        let scanline_capable = !sources.is_empty()
            && sources.iter().all(|(_, s)| s.scanline().is_some());

        if scanline_capable {
            self.composite_scanline(&mut core, &sources, height);
        } else {
            self.composite_frames(&mut core, &sources);
        }

        // Publish and raise VBlank.
        {
            let mut front = self.front.pixels.lock().unwrap();
            let accumulator = &core.accumulator;
            front.clear();
            front.extend(accumulator.pixels.chunks_exact(4).map(|px| {
                u32::from_be_bytes([0, px[0], px[1], px[2]])
            }));
            self.front.width.store(accumulator.width, Ordering::Release);
            self.front.height.store(accumulator.height, Ordering::Release);
            self.front.fresh.store(true, Ordering::Release);
        }
        self.frames.fetch_add(1, Ordering::AcqRel);
        self.status.store(VIDEO_STATUS_VBLANK, Ordering::Release);
        if let Some(irq) = self.irq.lock().unwrap().as_ref() {
            irq.raise(IRQ_VBLANK);
        }

        for (_, source) in &sources {
            source.signal_vsync();
        }
    }

    fn composite_frames(&self, core: &mut Core, sources: &[(usize, Arc<dyn VideoSource>)]) {
        for (slot, source) in sources {
            if let Some(frame) = source.frame() {
                core.cached[*slot] = Some(frame);
            }
            let Some(frame) = core.cached[*slot].clone() else { continue };
            blend(&mut core.accumulator, &frame, source.alpha_capable());
        }
    }

    fn composite_scanline(
        &self,
        core: &mut Core,
        sources: &[(usize, Arc<dyn VideoSource>)],
        height: usize,
    ) {
        // Quiesce per-source render threads before touching rows.
        for (_, source) in sources {
            source.set_managed(true);
        }
        for (_, source) in sources {
            let mut spins = 0;
            while !source.render_idle() && spins < 10_000 {
                std::thread::yield_now();
                spins += 1;
            }
        }

        for (_, source) in sources {
            if let Some(scanline) = source.scanline() {
                scanline.start_frame();
            }
        }
        for y in 0..height {
            // Ascending layer order is the load-bearing invariant: the
            // copper at layer 0 must update shared registers before a
            // higher source renders the same row.
            for (_, source) in sources {
                if let Some(scanline) = source.scanline() {
                    scanline.process_scanline(y);
                }
            }
        }
        for (slot, source) in sources {
            if let Some(scanline) = source.scanline() {
                if let Some(frame) = scanline.finish_frame() {
                    core.cached[*slot] = Some(frame);
                }
            }
            let Some(frame) = core.cached[*slot].clone() else { continue };
            blend(&mut core.accumulator, &frame, source.alpha_capable());
        }

        for (_, source) in sources {
            source.set_managed(false);
        }
    }
}

// Centre a source frame over the accumulator (letterbox) and blend.
// Oversized sources are clipped.
fn blend(accumulator: &mut Frame, frame: &Frame, alpha_capable: bool) {
    let off_x = accumulator.width.saturating_sub(frame.width) / 2;
    let off_y = accumulator.height.saturating_sub(frame.height) / 2;
    let copy_w = frame.width.min(accumulator.width);
    let copy_h = frame.height.min(accumulator.height);

    for y in 0..copy_h {
        let src_row = y * frame.width * 4;
        let dst_row = ((y + off_y) * accumulator.width + off_x) * 4;
        for x in 0..copy_w {
            let src = src_row + x * 4;
            let dst = dst_row + x * 4;
            let alpha = frame.pixels[src + 3];
            if alpha == 0 {
                continue;
            }
            if alpha_capable && alpha < 255 {
                let a = alpha as u32;
                for c in 0..3 {
                    let s = frame.pixels[src + c] as u32;
                    let d = accumulator.pixels[dst + c] as u32;
                    accumulator.pixels[dst + c] = ((s * a + d * (255 - a)) / 255) as u8;
                }
                accumulator.pixels[dst + 3] = 255;
            } else {
                accumulator.pixels[dst..dst + 4]
                    .copy_from_slice(&frame.pixels[src..src + 4]);
            }
        }
    }
}

pub struct CompositorHandle {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CompositorHandle {
    /// Signalled stop; joins within one tick interval.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Device for Compositor {
    fn memconfig(&self) -> MemoryRange {
        vec![(VIDEO_BASE, VIDEO_LIMIT)]
    }
    fn read32(&self, addr: u32) -> u32 {
        match addr {
            VIDEO_CTRL => self.enabled.load(Ordering::Acquire) as u32,
            VIDEO_STATUS => self.status.load(Ordering::Acquire),
            VIDEO_WIDTH => self.front.width.load(Ordering::Acquire) as u32,
            VIDEO_HEIGHT => self.front.height.load(Ordering::Acquire) as u32,
            _ => 0,
        }
    }
    fn write32(&self, addr: u32, value: u32) {
        if addr == VIDEO_CTRL {
            self.enabled.store(value & 1 != 0, Ordering::Release);
        }
    }
}
