// This is the place for the execution contract every CPU core honours:
// the step-result shape the runner loop reacts to, the cooperative
// start/stop machinery, and the debug adapter. The cores themselves live
// under cpu/ and only implement EmulatorCpu.

use crate::error::EngineError;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Which architecture a core implements. Doubles as the CLI mode and the
/// program-extension mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuKind {
    Ie32,
    Ie64,
    M68k,
    Z80,
    Mos6502,
    X86,
}

impl CpuKind {
    pub fn from_extension(ext: &str) -> Option<CpuKind> {
        match ext.to_ascii_lowercase().as_str() {
            "iex" => Some(CpuKind::Ie32),
            "ie64" => Some(CpuKind::Ie64),
            "ie68" => Some(CpuKind::M68k),
            "ie80" => Some(CpuKind::Z80),
            "ie86" => Some(CpuKind::X86),
            "ie65" => Some(CpuKind::Mos6502),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CpuKind::Ie32 => "IE32",
            CpuKind::Ie64 => "IE64",
            CpuKind::M68k => "M68K",
            CpuKind::Z80 => "Z80",
            CpuKind::Mos6502 => "6502",
            CpuKind::X86 => "x86",
        }
    }

    pub fn big_endian_video(&self) -> bool {
        matches!(self, CpuKind::M68k)
    }
}

impl fmt::Display for CpuKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a core stopped stepping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// The program executed its architecture's halt idiom.
    Halted,
    IllegalInstruction { pc: u64, opcode: u32 },
    DivisionByZero { pc: u64 },
    BusError { pc: u64, addr: u32 },
    Unimplemented { pc: u64, opcode: u32 },
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::Halted => write!(f, "program halted"),
            HaltReason::IllegalInstruction { pc, opcode } => {
                write!(f, "illegal instruction {opcode:#x} at {pc:#x}")
            }
            HaltReason::DivisionByZero { pc } => write!(f, "division by zero at {pc:#x}"),
            HaltReason::BusError { pc, addr } => {
                write!(f, "bus error at {pc:#x} accessing {addr:#010x}")
            }
            HaltReason::Unimplemented { pc, opcode } => {
                write!(f, "unimplemented opcode {opcode:#x} at {pc:#x}")
            }
        }
    }
}

/// Result of executing one instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Continue,
    Halted(HaltReason),
}

/// Register-file snapshot for the debug adapter. Values are widened to
/// u64 so one shape serves every core.
#[derive(Debug, Clone)]
pub struct DebugSnapshot {
    pub kind: CpuKind,
    pub pc: u64,
    pub registers: Vec<(&'static str, u64)>,
    pub flags: String,
    pub instructions: u64,
}

/// The contract every core implements. State is owned exclusively by the
/// core; the outside world sees it only through `debug_snapshot`.
pub trait EmulatorCpu: Send {
    fn kind(&self) -> CpuKind;

    /// Copy a program image into RAM at the load address and point the
    /// program counter at the entry.
    fn load_program(&mut self, image: &[u8], load_addr: u32, entry: u32);

    /// Execute exactly one instruction.
    fn step(&mut self) -> StepResult;

    /// Clear architectural state. RAM is untouched; the instruction
    /// counter restarts at zero.
    fn reset(&mut self);

    fn debug_snapshot(&self) -> DebugSnapshot;

    /// Default load address when the CLI does not override it.
    fn default_load_addr(&self) -> u32;
}

/// Interrupt latch shared between MMIO devices and a core. Devices set a
/// level; the core samples and clears it at instruction boundaries.
pub struct InterruptLine {
    pending: AtomicU8,
}

pub const IRQ_VBLANK: u8 = 1 << 0;
pub const IRQ_TIMER: u8 = 1 << 1;

impl InterruptLine {
    pub fn new() -> Arc<InterruptLine> {
        Arc::new(InterruptLine { pending: AtomicU8::new(0) })
    }
    pub fn raise(&self, irq: u8) {
        self.pending.fetch_or(irq, Ordering::AcqRel);
    }
    pub fn take(&self) -> u8 {
        self.pending.swap(0, Ordering::AcqRel)
    }
    pub fn clear(&self) {
        self.pending.store(0, Ordering::Release);
    }
}

/// Shared control block between the runner thread and the rest of the
/// machine: the cooperative stop flags, the externally visible
/// instruction counter and the perf accumulators.
pub struct CpuControl {
    pub running: AtomicBool,
    pub finished: AtomicBool,
    pub instructions: AtomicU64,
    pub perf_enabled: AtomicBool,
    perf_base_ns: AtomicU64,
    pub halt: Mutex<Option<HaltReason>>,
    pub debug: DebugControl,
}

impl CpuControl {
    pub fn new() -> Arc<CpuControl> {
        Arc::new(CpuControl {
            running: AtomicBool::new(false),
            finished: AtomicBool::new(true),
            instructions: AtomicU64::new(0),
            perf_enabled: AtomicBool::new(false),
            perf_base_ns: AtomicU64::new(0),
            halt: Mutex::new(None),
            debug: DebugControl::new(),
        })
    }

    pub fn set_perf(&self, enabled: bool) {
        self.perf_enabled.store(enabled, Ordering::Release);
    }

    pub fn perf_elapsed(&self) -> Duration {
        Duration::from_nanos(self.perf_base_ns.load(Ordering::Acquire))
    }
}

/// Breakpoints and single-step state for the debug adapter. Armed is a
/// cheap atomic so the hot loop pays one load when debugging is off.
pub struct DebugControl {
    pub active: AtomicBool,
    armed: AtomicBool,
    breakpoints: Mutex<HashSet<u64>>,
    pub paused: AtomicBool,
    step_budget: AtomicU32,
    pub snapshot: Mutex<Option<DebugSnapshot>>,
}

impl DebugControl {
    fn new() -> DebugControl {
        DebugControl {
            active: AtomicBool::new(false),
            armed: AtomicBool::new(false),
            breakpoints: Mutex::new(HashSet::new()),
            paused: AtomicBool::new(false),
            step_budget: AtomicU32::new(0),
            snapshot: Mutex::new(None),
        }
    }

    pub fn add_breakpoint(&self, addr: u64) {
        let mut bps = self.breakpoints.lock().unwrap();
        bps.insert(addr);
        self.armed.store(true, Ordering::Release);
    }

    pub fn remove_breakpoint(&self, addr: u64) {
        let mut bps = self.breakpoints.lock().unwrap();
        bps.remove(&addr);
        if bps.is_empty() && !self.active.load(Ordering::Acquire) {
            self.armed.store(false, Ordering::Release);
        }
    }

    /// Toggle the adapter itself (F9). Active means the runner pauses at
    /// the next boundary and publishes snapshots.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
        if active {
            self.paused.store(true, Ordering::Release);
            self.armed.store(true, Ordering::Release);
        } else {
            self.paused.store(false, Ordering::Release);
            self.armed
                .store(!self.breakpoints.lock().unwrap().is_empty(), Ordering::Release);
        }
    }

    /// Let the core run `n` more instructions while paused.
    pub fn single_step(&self, n: u32) {
        self.step_budget.store(n, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn latest_snapshot(&self) -> Option<DebugSnapshot> {
        self.snapshot.lock().unwrap().clone()
    }

    fn hit(&self, pc: u64) -> bool {
        self.breakpoints.lock().unwrap().contains(&pc)
    }
}

/// Owns a core's execution thread. The core itself is moved into the
/// thread and handed back by `stop`, so the debug adapter can inspect a
/// stopped machine without any shared mutable state.
pub struct CpuRunner {
    control: Arc<CpuControl>,
    handle: Option<JoinHandle<Box<dyn EmulatorCpu>>>,
}

impl CpuRunner {
    pub fn start(mut cpu: Box<dyn EmulatorCpu>, control: Arc<CpuControl>) -> CpuRunner {
        control.running.store(true, Ordering::Release);
        control.finished.store(false, Ordering::Release);
        *control.halt.lock().unwrap() = None;
        let ctl = Arc::clone(&control);
        let handle = std::thread::Builder::new()
            .name(format!("cpu-{}", cpu.kind().name().to_lowercase()))
            .spawn(move || {
                run_loop(cpu.as_mut(), &ctl);
                cpu
            })
            .expect("spawning the CPU thread cannot fail on a healthy host");
        CpuRunner { control, handle: Some(handle) }
    }

    /// Cooperative stop: the core finishes its current instruction, the
    /// thread parks, and ownership of the core comes back to the caller.
    pub fn stop(mut self) -> Box<dyn EmulatorCpu> {
        self.control.running.store(false, Ordering::Release);
        let handle = self.handle.take().expect("runner stopped twice");
        let cpu = handle.join().expect("CPU thread panicked");
        self.control.finished.store(true, Ordering::Release);
        cpu
    }

    pub fn control(&self) -> &Arc<CpuControl> {
        &self.control
    }
}

// The uniform fetch-decode-execute driver shared by every core.
fn run_loop(cpu: &mut dyn EmulatorCpu, control: &Arc<CpuControl>) {
    let perf = control.perf_enabled.load(Ordering::Acquire);
    let started = Instant::now();
    // Resuming a runner keeps counting from where it left off; the
    // counter only ever moves forward until a reset replaces the control
    // block.
    let mut local_count: u64 = control.instructions.load(Ordering::Acquire);

    while control.running.load(Ordering::Acquire) {
        if control.debug.armed.load(Ordering::Acquire) {
            debug_gate(cpu, control);
            if !control.running.load(Ordering::Acquire) {
                break;
            }
        }
        match cpu.step() {
            StepResult::Continue => {
                local_count += 1;
                // Publish in batches; the counter only needs to be exact
                // at instruction boundaries observed after a stop.
                if local_count & 0xFFF == 0 {
                    control.instructions.store(local_count, Ordering::Release);
                }
            }
            StepResult::Halted(reason) => {
                local_count += 1;
                match reason {
                    HaltReason::Halted => log::info!("{} halted cleanly", cpu.kind()),
                    ref fault => log::error!("{} fault: {fault}", cpu.kind()),
                }
                *control.halt.lock().unwrap() = Some(reason);
                break;
            }
        }
    }

    control.instructions.store(local_count, Ordering::Release);
    if perf {
        control
            .perf_base_ns
            .store(started.elapsed().as_nanos() as u64, Ordering::Release);
    }
    control.finished.store(true, Ordering::Release);
}

// Breakpoint / single-step gate, entered only when armed. Spin-sleeps at
// millisecond granularity while paused; publishes a snapshot each pause.
fn debug_gate(cpu: &mut dyn EmulatorCpu, control: &Arc<CpuControl>) {
    let snapshot = cpu.debug_snapshot();
    let pc = snapshot.pc;
    if control.debug.hit(pc) {
        control.debug.paused.store(true, Ordering::Release);
    }
    if !control.debug.paused.load(Ordering::Acquire) {
        return;
    }
    *control.debug.snapshot.lock().unwrap() = Some(snapshot);
    while control.debug.paused.load(Ordering::Acquire) && control.running.load(Ordering::Acquire) {
        let budget = control.debug.step_budget.load(Ordering::Acquire);
        if budget > 0 {
            control.debug.step_budget.store(budget - 1, Ordering::Release);
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Read a raw program image from disk. 6502 and Plus/4 images may carry a
/// PRG-style two-byte little-endian load-address prelude, which the core's
/// loader consumes.
pub fn read_image(path: &Path) -> Result<Vec<u8>, EngineError> {
    std::fs::read(path).map_err(|source| EngineError::ProgramImage {
        path: path.to_path_buf(),
        source,
    })
}
