// The Intuition Engine: a synthetic 32/64-bit home-computer platform.
// The bus and its MMIO dispatch live in memory, the CPU contract and
// the six cores under processor/cpu, the 44.1 kHz mixer and the chip
// engines under audio/chips, the layered compositor and its sources
// under video, and the lifecycle controller ties the whole machine
// together.

pub mod audio;
pub mod chips;
pub mod coproc;
pub mod cpu;
pub mod devices;
pub mod error;
pub mod host;
pub mod ipc;
pub mod lifecycle;
pub mod memory;
pub mod mmio;
pub mod processor;
pub mod video;

pub use error::EngineError;
pub use lifecycle::{BootRequest, ChipKind, Machine};
pub use memory::{Bus, BusPtr, LegacyMmio64};
pub use processor::{CpuKind, EmulatorCpu, HaltReason, StepResult};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Feature summary for `--features`.
pub fn feature_list() -> Vec<&'static str> {
    vec![
        "cpu: IE32, IE64 (FP32 FPU), M68K, Z80, 6502, x86-32",
        "audio: 9-voice synth, PSG, SID (6581/8580), POKEY, TED, AHX",
        "audio: PLUS modes with 4x oversampling and stereo spread",
        "video: framebuffer chip with copper and blitter",
        "video: VGA, ULA, TED, ANTIC/GTIA, Voodoo rasteriser",
        "platform: coprocessor channels, single-instance IPC",
    ]
}
