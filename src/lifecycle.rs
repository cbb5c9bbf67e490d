// The lifecycle controller: the single mutating entry point for cold
// boot, program load, mode switch and the F10 hard reset. Everything
// stateful in the machine hangs off Machine; run_program_with_full_reset
// walks the stop/reset/reload/restart order under one lifecycle lock,
// during which no CPU executes and no mixer or compositor tick is in
// flight.

use crate::audio::{AudioEngine, AudioSink, MixerHandle, SampleTicker};
use crate::chips::{ahx::Ahx, pokey::Pokey, psg::Psg, sid::Sid, sid::SidModel, ted::TedSound};
use crate::coproc::CoprocManager;
use crate::cpu::build_cpu;
use crate::devices::{Device, FileIo, MediaLoader, ProgramExecutor, Terminal, TerminalMode};
use crate::error::EngineError;
use crate::memory::{Bus, BusPtr};
use crate::mmio::VIDEO_STATUS;
use crate::processor::{read_image, CpuControl, CpuKind, CpuRunner, InterruptLine};
use crate::video::antic::Antic;
use crate::video::framebuffer::FramebufferChip;
use crate::video::ted::TedVideo;
use crate::video::ula::Ula;
use crate::video::vga::{self, Vga};
use crate::video::voodoo::Voodoo;
use crate::video::{Compositor, CompositorHandle, VideoSource};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

/// Which chip engine a boot activates as the audio sample ticker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipKind {
    Psg,
    Sid,
    Pokey,
    Ted,
    Ahx,
}

impl ChipKind {
    pub fn from_extension(ext: &str) -> Option<ChipKind> {
        match ext.to_ascii_lowercase().as_str() {
            "ym" | "ay" | "vgm" | "vgz" | "sndh" => Some(ChipKind::Psg),
            "sid" => Some(ChipKind::Sid),
            "sap" => Some(ChipKind::Pokey),
            "ted" => Some(ChipKind::Ted),
            "ahx" => Some(ChipKind::Ahx),
            _ => None,
        }
    }
}

/// Everything one boot needs to know.
#[derive(Debug, Clone)]
pub struct BootRequest {
    pub cpu: CpuKind,
    pub program: Option<PathBuf>,
    pub load_addr: Option<u32>,
    pub entry: Option<u32>,
    pub chip: Option<ChipKind>,
    pub chip_plus: bool,
    pub boot_to_basic: bool,
    pub basic_image: Option<PathBuf>,
    pub perf: bool,
}

impl Default for BootRequest {
    fn default() -> BootRequest {
        BootRequest {
            cpu: CpuKind::Ie64,
            program: None,
            load_addr: None,
            entry: None,
            chip: None,
            chip_plus: false,
            boot_to_basic: false,
            basic_image: None,
            perf: false,
        }
    }
}

pub type AudioSinkFactory = Box<dyn Fn() -> Box<dyn AudioSink> + Send>;

struct Running {
    runner: CpuRunner,
    control: Arc<CpuControl>,
    compositor_handle: CompositorHandle,
    mixer_handle: MixerHandle,
}

/// The machine: the bus plus every stateful component, owned in one
/// place so the reset order below can actually be enforced.
pub struct Machine {
    pub bus: BusPtr,
    pub engine: Arc<AudioEngine>,
    pub compositor: Arc<Compositor>,
    pub terminal: Arc<Terminal>,
    file_io: Arc<FileIo>,
    media: Arc<MediaLoader>,
    coproc: Arc<CoprocManager>,
    irq: Arc<InterruptLine>,

    framebuffer: Arc<FramebufferChip>,
    vga: Arc<Vga>,
    ula: Arc<Ula>,
    ted_video: Arc<TedVideo>,
    antic: Arc<Antic>,
    sources: Vec<Arc<dyn VideoSource>>,

    psg: Arc<Psg>,
    sid: Arc<Sid>,
    pokey: Arc<Pokey>,
    ted_sound: Arc<TedSound>,
    ahx: Arc<Ahx>,

    lifecycle: Mutex<()>,
    running: Mutex<Option<Running>>,
    audio_sink_factory: Mutex<AudioSinkFactory>,
    exec_rx: Receiver<PathBuf>,
    exec_tx: Sender<PathBuf>,
    last_boot: Mutex<BootRequest>,
}

impl Machine {
    pub fn new(sandbox_root: PathBuf, audio_sink_factory: AudioSinkFactory) -> Arc<Machine> {
        let bus = Bus::new();
        let engine = AudioEngine::new();
        let compositor = Compositor::new();
        let irq = InterruptLine::new();
        compositor.set_irq(Arc::clone(&irq));

        let terminal = Terminal::new();
        terminal.connect(&bus);
        let file_io = FileIo::new(sandbox_root.clone());
        file_io.connect(&bus);
        let media = MediaLoader::new(sandbox_root);
        media.connect(&bus);
        let coproc = CoprocManager::new();
        coproc.connect(&bus);

        let (exec_tx, exec_rx) = unbounded();
        let executor = ProgramExecutor::new(exec_tx.clone());
        executor.connect(&bus);

        let framebuffer = FramebufferChip::new(compositor.status_cell());
        framebuffer.connect(&bus);
        let vga = Vga::new();
        vga.connect(&bus);
        let ula = Ula::new();
        ula.connect(&bus);
        let ted_video = TedVideo::new();
        ted_video.connect(&bus);
        let antic = Antic::new();
        antic.connect(&bus);
        let voodoo = Voodoo::new();

        let psg = Psg::new(Arc::clone(&engine));
        let sid = Sid::new(Arc::clone(&engine), crate::chips::sid::PAL_CLOCK, SidModel::Mos6581);
        let pokey = Pokey::new(Arc::clone(&engine));
        let ted_sound = TedSound::new(Arc::clone(&engine));
        let ahx = Ahx::new(Arc::clone(&engine));

        // Register the whole MMIO surface once; registrations survive
        // every reset.
        bus.attach(Arc::clone(&terminal) as Arc<dyn Device>);
        bus.attach(Arc::clone(&file_io) as Arc<dyn Device>);
        bus.attach(Arc::clone(&media) as Arc<dyn Device>);
        bus.attach(executor as Arc<dyn Device>);
        bus.attach(crate::audio::SynthDevice::new(Arc::clone(&engine)) as Arc<dyn Device>);
        bus.attach(Arc::clone(&compositor) as Arc<dyn Device>);
        bus.attach(Arc::clone(&framebuffer) as Arc<dyn Device>);
        bus.attach(Arc::clone(&vga) as Arc<dyn Device>);
        bus.attach(Arc::clone(&ula) as Arc<dyn Device>);
        bus.attach(Arc::clone(&ted_video) as Arc<dyn Device>);
        bus.attach(Arc::clone(&antic) as Arc<dyn Device>);
        bus.attach64(Arc::clone(&voodoo) as Arc<dyn crate::devices::Device64>);
        bus.attach(Arc::clone(&coproc) as Arc<dyn Device>);
        bus.attach(Arc::clone(&psg) as Arc<dyn Device>);
        bus.attach(Arc::clone(&sid) as Arc<dyn Device>);
        bus.attach(Arc::clone(&pokey) as Arc<dyn Device>);
        bus.attach(Arc::clone(&ted_sound) as Arc<dyn Device>);
        bus.attach(Arc::clone(&ahx) as Arc<dyn Device>);
        bus.set_video_status_reader(VIDEO_STATUS, compositor.status_cell());

        let sources: Vec<Arc<dyn VideoSource>> = vec![
            Arc::clone(&framebuffer) as Arc<dyn VideoSource>,
            Arc::clone(&vga) as Arc<dyn VideoSource>,
            Arc::clone(&ula) as Arc<dyn VideoSource>,
            Arc::clone(&ted_video) as Arc<dyn VideoSource>,
            Arc::clone(&antic) as Arc<dyn VideoSource>,
            Arc::clone(&voodoo) as Arc<dyn VideoSource>,
        ];
        for source in &sources {
            compositor.register(Arc::clone(source));
        }

        Arc::new(Machine {
            bus,
            engine,
            compositor,
            terminal,
            file_io,
            media,
            coproc,
            irq,
            framebuffer,
            vga,
            ula,
            ted_video,
            antic,
            sources,
            psg,
            sid,
            pokey,
            ted_sound,
            ahx,
            lifecycle: Mutex::new(()),
            running: Mutex::new(None),
            audio_sink_factory: Mutex::new(audio_sink_factory),
            exec_rx,
            exec_tx,
            last_boot: Mutex::new(BootRequest::default()),
        })
    }

    pub fn set_sid_ntsc(&self, ntsc: bool) {
        self.sid.set_clock(if ntsc {
            crate::chips::sid::NTSC_CLOCK
        } else {
            crate::chips::sid::PAL_CLOCK
        });
    }

    pub fn set_sid_model(&self, model: SidModel) {
        self.sid.set_model(model);
    }

    /// Path sender used by the IPC acceptor; shares the queue the
    /// program-executor device feeds.
    pub fn open_request_sender(&self) -> Sender<PathBuf> {
        self.exec_tx.clone()
    }

    /// Guest- or IPC-requested reboots, drained by the host main loop.
    pub fn pending_open_request(&self) -> Option<PathBuf> {
        self.exec_rx.try_recv().ok()
    }

    pub fn cpu_control(&self) -> Option<Arc<CpuControl>> {
        self.running.lock().unwrap().as_ref().map(|r| Arc::clone(&r.control))
    }

    pub fn active_chip(&self, kind: ChipKind) -> Arc<dyn SampleTicker> {
        match kind {
            ChipKind::Psg => Arc::clone(&self.psg) as Arc<dyn SampleTicker>,
            ChipKind::Sid => Arc::clone(&self.sid) as Arc<dyn SampleTicker>,
            ChipKind::Pokey => Arc::clone(&self.pokey) as Arc<dyn SampleTicker>,
            ChipKind::Ted => Arc::clone(&self.ted_sound) as Arc<dyn SampleTicker>,
            ChipKind::Ahx => Arc::clone(&self.ahx) as Arc<dyn SampleTicker>,
        }
    }

    /// The §4.7 thirteen-step order, under the lifecycle lock.
    pub fn run_program_with_full_reset(self: &Arc<Machine>, request: BootRequest) -> Result<(), EngineError> {
        let _guard = self.lifecycle.lock().unwrap();
        log::info!(
            "lifecycle: booting {} ({})",
            request.cpu,
            request
                .program
                .as_ref()
                .map_or_else(|| "no program".into(), |p| p.display().to_string())
        );

        // 1-4: wind down whatever is running.
        if let Some(running) = self.running.lock().unwrap().take() {
            running.control.debug.set_active(false);
            running.control.debug.resume();
            let _cpu = running.runner.stop();
            running.compositor_handle.stop();
            self.engine.stop();
            running.mixer_handle.join();
        }
        self.coproc.stop();

        // 5: a fresh core, never a reused one.
        let mut cpu = build_cpu(request.cpu, Arc::clone(&self.bus), Arc::clone(&self.irq));

        // 6-7: audio engine, players and chips.
        self.engine.reset();
        self.engine.clear_tickers();
        for chip in [
            Arc::clone(&self.psg) as Arc<dyn SampleTicker>,
            Arc::clone(&self.sid) as Arc<dyn SampleTicker>,
            Arc::clone(&self.pokey) as Arc<dyn SampleTicker>,
            Arc::clone(&self.ted_sound) as Arc<dyn SampleTicker>,
            Arc::clone(&self.ahx) as Arc<dyn SampleTicker>,
        ] {
            chip.reset();
        }

        // 8: RAM to zero, registrations intact.
        self.bus.reset();

        // 9: every video source.
        for source in &self.sources {
            source.reset();
        }
        self.compositor.reset();
        let big_endian = request.cpu.big_endian_video();
        for source in &self.sources {
            source.set_big_endian(big_endian);
        }

        // 10: terminal, coprocessor; BASIC boots talk to the in-window
        // terminal.
        self.terminal.reset();
        self.file_io.reset();
        self.media.reset();
        self.coproc.reset();
        self.irq.clear();
        if request.boot_to_basic {
            self.terminal.set_mode(TerminalMode::VideoText);
            self.vga.set_mode(vga::MODE_TEXT);
        } else {
            self.terminal.set_mode(TerminalMode::HostStdio);
        }

        // Activate the requested chip engine.
        if let Some(kind) = request.chip {
            let ticker = self.active_chip(kind);
            self.engine.register_ticker(ticker);
            match kind {
                ChipKind::Psg => self.psg.set_plus(request.chip_plus),
                ChipKind::Sid => self.sid.set_plus(request.chip_plus),
                ChipKind::Pokey => self.pokey.set_plus(request.chip_plus),
                ChipKind::Ted => self.ted_sound.set_plus(request.chip_plus),
                ChipKind::Ahx => self.ahx.set_plus(request.chip_plus),
            }
        }

        // The mode-appropriate display comes up enabled: the ULA for Z80
        // machines, TED video for Plus/4 sound boots, ANTIC for POKEY
        // boots, the framebuffer chip everywhere else. The Voodoo wakes
        // itself on its first buffer swap.
        match (request.cpu, request.chip) {
            (CpuKind::Z80, _) => self.ula.set_enabled(true),
            (_, Some(ChipKind::Ted)) => self.ted_video.set_enabled(true),
            (_, Some(ChipKind::Pokey)) => self.antic.set_enabled(true),
            _ => self.framebuffer.set_enabled(!request.boot_to_basic),
        }

        // 11: the program image.
        let image = match (&request.program, request.boot_to_basic, &request.basic_image) {
            (Some(path), _, _) => Some(read_image(path)?),
            (None, true, Some(path)) => Some(read_image(path)?),
            (None, true, None) => {
                return Err(EngineError::config(
                    "boot to BASIC requested but no BASIC image is available \
                     (supply --basic-image)",
                ))
            }
            (None, false, _) => None,
        };
        let load_addr = request.load_addr.unwrap_or_else(|| cpu.default_load_addr());
        let entry = request.entry.unwrap_or(load_addr);
        if let Some(image) = &image {
            cpu.load_program(image, load_addr, entry);
            log::info!(
                "lifecycle: loaded {} bytes at {:#010x}, entry {:#010x}",
                image.len(),
                load_addr,
                entry
            );
        }

        // 12: restart video, audio and the coprocessor pool.
        let compositor_handle = self.compositor.start();
        let sink = (self.audio_sink_factory.lock().unwrap())();
        let mixer_handle = self.engine.start(sink);
        let coproc_bus = Arc::clone(&self.bus);
        let coproc_irq = InterruptLine::new();
        let coproc_kind = request.cpu;
        self.coproc.start(Arc::new(move || {
            build_cpu(coproc_kind, Arc::clone(&coproc_bus), Arc::clone(&coproc_irq))
        }));

        // 13: light the new CPU.
        let control = CpuControl::new();
        control.set_perf(request.perf);
        let runner = CpuRunner::start(cpu, Arc::clone(&control));

        *self.running.lock().unwrap() = Some(Running {
            runner,
            control,
            compositor_handle,
            mixer_handle,
        });
        *self.last_boot.lock().unwrap() = request;
        Ok(())
    }

    /// F10: hard reset back to BASIC, keeping the current CPU mode's
    /// BASIC environment (always IE64 plus the configured BASIC image).
    pub fn hard_reset_to_basic(self: &Arc<Machine>) -> Result<(), EngineError> {
        let mut request = self.last_boot.lock().unwrap().clone();
        request.program = None;
        request.boot_to_basic = true;
        request.cpu = CpuKind::Ie64;
        self.run_program_with_full_reset(request)
    }

    /// IPC/guest OPEN: re-enter the lifecycle with a new path, deriving
    /// the CPU mode from the file extension.
    pub fn open_path(self: &Arc<Machine>, path: PathBuf) -> Result<(), EngineError> {
        let mut request = self.last_boot.lock().unwrap().clone();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if let Some(kind) = CpuKind::from_extension(ext) {
            request.cpu = kind;
            request.chip = None;
        } else if let Some(chip) = ChipKind::from_extension(ext) {
            request.chip = Some(chip);
            request.cpu = CpuKind::Ie32;
        } else {
            return Err(EngineError::config(format!(
                "cannot infer a machine mode from {path:?}"
            )));
        }
        request.program = Some(path);
        request.boot_to_basic = false;
        request.load_addr = None;
        request.entry = None;
        self.run_program_with_full_reset(request)
    }

    /// Orderly teardown at process exit.
    pub fn shutdown(self: &Arc<Machine>) {
        let _guard = self.lifecycle.lock().unwrap();
        if let Some(running) = self.running.lock().unwrap().take() {
            let _ = running.runner.stop();
            running.compositor_handle.stop();
            self.engine.stop();
            running.mixer_handle.join();
        }
        self.coproc.stop();
    }

    pub fn toggle_debugger(&self) {
        if let Some(running) = self.running.lock().unwrap().as_ref() {
            let active = running.control.debug.active.load(Ordering::Acquire);
            running.control.debug.set_active(!active);
            log::info!("debug adapter {}", if active { "detached" } else { "attached" });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioSink;

    struct NullAudio;
    impl AudioSink for NullAudio {
        fn write(&mut self, _interleaved: &[f32]) {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    fn test_machine() -> Arc<Machine> {
        Machine::new(std::env::temp_dir(), Box::new(|| Box::new(NullAudio)))
    }

    #[test]
    fn boot_without_program_idles_cleanly() {
        let machine = test_machine();
        let request = BootRequest { cpu: CpuKind::Ie32, ..BootRequest::default() };
        machine.run_program_with_full_reset(request).unwrap();
        machine.shutdown();
    }

    #[test]
    fn basic_boot_without_image_is_config_error() {
        let machine = test_machine();
        let request = BootRequest { boot_to_basic: true, ..BootRequest::default() };
        let err = machine.run_program_with_full_reset(request).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn full_reset_zeroes_memory_outside_image() {
        let machine = test_machine();
        machine.bus.write32(0x4000, 0xDEAD_BEEF);

        let dir = std::env::temp_dir().join("ie-lifecycle-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("prog.iex");
        let program = crate::cpu::ie32::asm::assemble(&[crate::cpu::ie32::asm::HALT]);
        std::fs::write(&path, &program).unwrap();

        let request = BootRequest {
            cpu: CpuKind::Ie32,
            program: Some(path),
            ..BootRequest::default()
        };
        machine.run_program_with_full_reset(request).unwrap();

        // Memory outside the loaded range is zero again.
        assert_eq!(machine.bus.read32(0x4000), 0);
        // The image itself landed at the default load address.
        assert_eq!(machine.bus.read32(0x1000), crate::cpu::ie32::asm::HALT);
        machine.shutdown();
    }

    #[test]
    fn instruction_counter_resets_across_boots() {
        let machine = test_machine();
        let dir = std::env::temp_dir().join("ie-lifecycle-test2");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("loop.iex");
        // A few instructions then halt.
        let program = crate::cpu::ie32::asm::assemble(&[
            crate::cpu::ie32::asm::i(0x03, 1, 1, 1),
            crate::cpu::ie32::asm::i(0x03, 1, 1, 1),
            crate::cpu::ie32::asm::HALT,
        ]);
        std::fs::write(&path, &program).unwrap();
        let request = BootRequest {
            cpu: CpuKind::Ie32,
            program: Some(path.clone()),
            ..BootRequest::default()
        };
        machine.run_program_with_full_reset(request.clone()).unwrap();
        let control = machine.cpu_control().unwrap();
        // Wait for the tiny program to halt.
        for _ in 0..500 {
            if control.finished.load(Ordering::Acquire) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(control.instructions.load(Ordering::Acquire) >= 3);

        machine.run_program_with_full_reset(request).unwrap();
        let control = machine.cpu_control().unwrap();
        // The fresh control block starts from zero; by the time we see
        // it the counter is at most the program length.
        assert!(control.instructions.load(Ordering::Acquire) <= 3);
        machine.shutdown();
    }
}
