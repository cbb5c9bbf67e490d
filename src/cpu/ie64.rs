// The IE64 core: the 64-bit superset of IE32 with an FP32 FPU bank.
// Same instruction word layout as IE32; integer registers widen to 64
// bits, loads gain LD64/ST64 and sign-extending 32-bit forms, and the
// 0x4x opcode page addresses the f0..f15 single-precision registers.
// FDIV follows IEEE semantics (dividing by zero yields an infinity, not
// a fault); integer DIVU still halts on zero.

use crate::cpu::REG_NAMES_16;
use crate::memory::BusPtr;
use crate::mmio::TERM_DATA;
use crate::processor::{CpuKind, DebugSnapshot, EmulatorCpu, HaltReason, StepResult};

pub const LOAD_ADDR: u32 = 0x1000;

pub struct Ie64 {
    pub regs: [u64; 16],
    pub fregs: [f32; 16],
    pub pc: u32,
    executed: u64,
    bus: BusPtr,
}

mod op {
    pub const NOP: u32 = 0x00;
    pub const LUI: u32 = 0x01;
    pub const ORI: u32 = 0x02;
    pub const ADDI: u32 = 0x03;
    pub const ADD: u32 = 0x10;
    pub const SUB: u32 = 0x11;
    pub const AND: u32 = 0x12;
    pub const OR: u32 = 0x13;
    pub const XOR: u32 = 0x14;
    pub const SLL: u32 = 0x15;
    pub const SRL: u32 = 0x16;
    pub const SRA: u32 = 0x17;
    pub const MUL: u32 = 0x18;
    pub const DIVU: u32 = 0x19;
    pub const SLT: u32 = 0x1A;
    pub const SLTU: u32 = 0x1B;
    pub const LD8U: u32 = 0x20;
    pub const LD16U: u32 = 0x21;
    pub const LD32U: u32 = 0x22;
    pub const LD8S: u32 = 0x23;
    pub const LD16S: u32 = 0x24;
    pub const LD32S: u32 = 0x25;
    pub const LD64: u32 = 0x26;
    pub const ST8: u32 = 0x28;
    pub const ST16: u32 = 0x29;
    pub const ST32: u32 = 0x2A;
    pub const ST64: u32 = 0x2B;
    pub const BEQ: u32 = 0x30;
    pub const BNE: u32 = 0x31;
    pub const BLT: u32 = 0x32;
    pub const BGE: u32 = 0x33;
    pub const BLTU: u32 = 0x34;
    pub const BGEU: u32 = 0x35;
    pub const JAL: u32 = 0x38;
    pub const JALR: u32 = 0x39;
    pub const SYS: u32 = 0x3F;
    pub const FADD: u32 = 0x40;
    pub const FSUB: u32 = 0x41;
    pub const FMUL: u32 = 0x42;
    pub const FDIV: u32 = 0x43;
    pub const FMOV: u32 = 0x44;
    pub const FITOF: u32 = 0x45;
    pub const FTOI: u32 = 0x46;
    pub const FLD: u32 = 0x47;
    pub const FST: u32 = 0x48;
}

#[inline]
fn simm16(word: u32) -> i64 {
    (word & 0xFFFF) as u16 as i16 as i64
}

#[inline]
fn simm12(word: u32) -> i32 {
    ((word & 0x0FFF) as i32) << 20 >> 20
}

#[inline]
fn simm20(word: u32) -> i32 {
    ((word & 0xF_FFFF) as i32) << 12 >> 12
}

impl Ie64 {
    pub fn new(bus: BusPtr) -> Ie64 {
        Ie64 { regs: [0; 16], fregs: [0.0; 16], pc: LOAD_ADDR, executed: 0, bus }
    }

    #[inline]
    fn set_reg(&mut self, rd: usize, value: u64) {
        if rd != 0 {
            self.regs[rd] = value;
        }
    }

    fn exec(&mut self, word: u32) -> StepResult {
        let pc = self.pc;
        let next = pc.wrapping_add(4);
        let rd = ((word >> 20) & 0xF) as usize;
        let rs1 = ((word >> 16) & 0xF) as usize;
        let rs2 = ((word >> 12) & 0xF) as usize;
        let a = self.regs[rs1];
        let b = self.regs[rs2];
        let fa = self.fregs[rs1];
        let fb = self.fregs[rs2];
        self.pc = next;
        match word >> 24 {
            op::NOP => {}
            op::LUI => self.set_reg(rd, ((word & 0xFFFF) as u64) << 16),
            op::ORI => self.set_reg(rd, a | (word & 0xFFFF) as u64),
            op::ADDI => self.set_reg(rd, a.wrapping_add(simm16(word) as u64)),
            op::ADD => self.set_reg(rd, a.wrapping_add(b)),
            op::SUB => self.set_reg(rd, a.wrapping_sub(b)),
            op::AND => self.set_reg(rd, a & b),
            op::OR => self.set_reg(rd, a | b),
            op::XOR => self.set_reg(rd, a ^ b),
            op::SLL => self.set_reg(rd, a.wrapping_shl(b as u32 & 63)),
            op::SRL => self.set_reg(rd, a.wrapping_shr(b as u32 & 63)),
            op::SRA => self.set_reg(rd, (a as i64).wrapping_shr(b as u32 & 63) as u64),
            op::MUL => self.set_reg(rd, a.wrapping_mul(b)),
            op::DIVU => {
                if b == 0 {
                    return StepResult::Halted(HaltReason::DivisionByZero { pc: pc as u64 });
                }
                self.set_reg(rd, a / b);
            }
            op::SLT => self.set_reg(rd, ((a as i64) < (b as i64)) as u64),
            op::SLTU => self.set_reg(rd, (a < b) as u64),
            op::LD8U | op::LD16U | op::LD32U | op::LD8S | op::LD16S | op::LD32S | op::LD64 => {
                let addr = (a as u32).wrapping_add(simm16(word) as u32);
                let value = match word >> 24 {
                    op::LD8U => self.bus.read8(addr) as u64,
                    op::LD16U => self.bus.read16(addr) as u64,
                    op::LD32U => self.bus.read32(addr) as u64,
                    op::LD8S => self.bus.read8(addr) as i8 as i64 as u64,
                    op::LD16S => self.bus.read16(addr) as i16 as i64 as u64,
                    op::LD32S => self.bus.read32(addr) as i32 as i64 as u64,
                    _ => self.bus.read64(addr),
                };
                self.set_reg(rd, value);
            }
            op::ST8 | op::ST16 | op::ST32 | op::ST64 => {
                let addr = (a as u32).wrapping_add(simm12(word) as u32);
                match word >> 24 {
                    op::ST8 => self.bus.write8(addr, b as u8),
                    op::ST16 => self.bus.write16(addr, b as u16),
                    op::ST32 => self.bus.write32(addr, b as u32),
                    _ => self.bus.write64(addr, b),
                }
            }
            op::BEQ | op::BNE | op::BLT | op::BGE | op::BLTU | op::BGEU => {
                let taken = match word >> 24 {
                    op::BEQ => a == b,
                    op::BNE => a != b,
                    op::BLT => (a as i64) < (b as i64),
                    op::BGE => (a as i64) >= (b as i64),
                    op::BLTU => a < b,
                    _ => a >= b,
                };
                if taken {
                    self.pc = next.wrapping_add((simm12(word) * 4) as u32);
                }
            }
            op::JAL => {
                self.set_reg(rd, next as u64);
                self.pc = next.wrapping_add((simm20(word) * 4) as u32);
            }
            op::JALR => {
                let target = (a as u32).wrapping_add(simm12(word) as u32);
                self.set_reg(rd, next as u64);
                self.pc = target;
            }
            op::SYS => match word & 0xFFFF {
                0 => return StepResult::Halted(HaltReason::Halted),
                1 => self.bus.write32(TERM_DATA, self.regs[1] as u32),
                2 => {
                    let c = self.bus.read32(TERM_DATA) as u64;
                    self.set_reg(1, c);
                }
                _ => {
                    return StepResult::Halted(HaltReason::IllegalInstruction {
                        pc: pc as u64,
                        opcode: word,
                    })
                }
            },
            op::FADD => self.fregs[rd] = fa + fb,
            op::FSUB => self.fregs[rd] = fa - fb,
            op::FMUL => self.fregs[rd] = fa * fb,
            op::FDIV => self.fregs[rd] = fa / fb,
            op::FMOV => self.fregs[rd] = fa,
            op::FITOF => self.fregs[rd] = self.regs[rs1] as i64 as f32,
            op::FTOI => self.set_reg(rd, fa as i64 as u64),
            op::FLD => {
                let addr = (a as u32).wrapping_add(simm12(word) as u32);
                self.fregs[rd] = f32::from_bits(self.bus.read32(addr));
            }
            op::FST => {
                let addr = (a as u32).wrapping_add(simm12(word) as u32);
                self.bus.write32(addr, self.fregs[rs2].to_bits());
            }
            _ => {
                return StepResult::Halted(HaltReason::IllegalInstruction {
                    pc: pc as u64,
                    opcode: word,
                })
            }
        }
        StepResult::Continue
    }
}

impl EmulatorCpu for Ie64 {
    fn kind(&self) -> CpuKind {
        CpuKind::Ie64
    }

    fn load_program(&mut self, image: &[u8], load_addr: u32, entry: u32) {
        self.bus.load_image(load_addr, image);
        self.pc = entry;
    }

    fn step(&mut self) -> StepResult {
        let (word, ok) = self.bus.read32_with_fault(self.pc);
        if !ok {
            return StepResult::Halted(HaltReason::BusError {
                pc: self.pc as u64,
                addr: self.pc,
            });
        }
        self.executed += 1;
        self.exec(word)
    }

    fn reset(&mut self) {
        self.regs = [0; 16];
        self.fregs = [0.0; 16];
        self.pc = LOAD_ADDR;
        self.executed = 0;
    }

    fn debug_snapshot(&self) -> DebugSnapshot {
        let mut registers: Vec<(&'static str, u64)> = REG_NAMES_16
            .iter()
            .zip(self.regs.iter())
            .map(|(name, value)| (*name, *value))
            .collect();
        registers.extend(
            F_NAMES
                .iter()
                .zip(self.fregs.iter())
                .map(|(name, value)| (*name, value.to_bits() as u64)),
        );
        DebugSnapshot {
            kind: CpuKind::Ie64,
            pc: self.pc as u64,
            registers,
            flags: String::new(),
            instructions: self.executed,
        }
    }

    fn default_load_addr(&self) -> u32 {
        LOAD_ADDR
    }
}

const F_NAMES: [&str; 16] = [
    "f0", "f1", "f2", "f3", "f4", "f5", "f6", "f7", "f8", "f9", "f10", "f11", "f12", "f13", "f14",
    "f15",
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::ie32::asm;
    use crate::memory::Bus;

    fn run(words: &[u32]) -> Ie64 {
        let bus = Bus::new();
        let mut cpu = Ie64::new(bus);
        cpu.load_program(&asm::assemble(words), LOAD_ADDR, LOAD_ADDR);
        for _ in 0..10_000 {
            if let StepResult::Halted(_) = cpu.step() {
                break;
            }
        }
        cpu
    }

    #[test]
    fn wide_shifts() {
        let cpu = run(&[
            asm::i(0x03, 1, 0, 1),     // addi r1, r0, 1
            asm::i(0x03, 2, 0, 40),    // addi r2, r0, 40
            asm::r(0x15, 3, 1, 2),     // sll r3, r1, r2
            asm::HALT,
        ]);
        assert_eq!(cpu.regs[3], 1 << 40);
    }

    #[test]
    fn ld64_round_trip() {
        let cpu = run(&[
            asm::i(0x01, 1, 0, 2),         // lui r1 -> 0x20000
            asm::i(0x03, 2, 0, 0x7FFF),    // addi r2, r0, 0x7fff
            asm::r(0x15, 2, 2, 3),         // sll r2, r2, r3(=0) no-op shift
            asm::s(0x2B, 1, 2, 0),         // st64 [r1], r2
            asm::i(0x26, 4, 1, 0),         // ld64 r4, [r1]
            asm::HALT,
        ]);
        assert_eq!(cpu.regs[4], 0x7FFF);
    }

    #[test]
    fn fpu_arithmetic() {
        let cpu = run(&[
            asm::i(0x03, 1, 0, 3),     // r1 = 3
            asm::i(0x03, 2, 0, 4),     // r2 = 4
            asm::r(0x45, 1, 1, 0),     // fitof f1, r1
            asm::r(0x45, 2, 2, 0),     // fitof f2, r2
            asm::r(0x42, 3, 1, 2),     // fmul f3, f1, f2
            asm::r(0x46, 5, 3, 0),     // ftoi r5, f3
            asm::HALT,
        ]);
        assert_eq!(cpu.regs[5], 12);
        assert_eq!(cpu.fregs[3], 12.0);
    }

    #[test]
    fn fdiv_by_zero_is_infinite_not_fatal() {
        let cpu = run(&[
            asm::i(0x03, 1, 0, 1),
            asm::r(0x45, 1, 1, 0),     // f1 = 1.0
            asm::r(0x43, 2, 1, 0),     // fdiv f2, f1, f0(=0)
            asm::HALT,
        ]);
        assert!(cpu.fregs[2].is_infinite());
    }
}
