// The six conforming cores. Each owns its architectural state outright
// and talks to the world exclusively through the memory bus; the shared
// execution contract lives in processor.rs.

pub mod ie32;
pub mod ie64;
pub mod m68k;
pub mod mos6502;
pub mod x86;
pub mod z80;

use crate::memory::BusPtr;
use crate::processor::{CpuKind, EmulatorCpu, InterruptLine};
use std::sync::Arc;

/// Construct a fresh core of the requested architecture. Mode switches
/// always come through here; cores are never reused across programs.
pub fn build_cpu(kind: CpuKind, bus: BusPtr, irq: Arc<InterruptLine>) -> Box<dyn EmulatorCpu> {
    match kind {
        CpuKind::Ie32 => Box::new(ie32::Ie32::new(bus)),
        CpuKind::Ie64 => Box::new(ie64::Ie64::new(bus)),
        CpuKind::M68k => Box::new(m68k::M68k::new(bus, irq)),
        CpuKind::Z80 => Box::new(z80::Z80::new(bus, irq)),
        CpuKind::Mos6502 => Box::new(mos6502::Mos6502::new(bus, irq)),
        CpuKind::X86 => Box::new(x86::X86::new(bus)),
    }
}

pub(crate) const REG_NAMES_16: [&str; 16] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "r13", "r14",
    "r15",
];
