// The IE32 core: the platform's native 32-bit RISC. Sixteen registers
// (r0 reads as zero), fixed 32-bit little-endian instruction words.
//
// Word layout, high byte first:
//   op   = bits 31..24
//   rd   = bits 23..20
//   rs1  = bits 19..16
//   rs2  = bits 15..12        (R-type)
//   imm16 = bits 15..0        (I-type, sign- or zero-extended per op)
//   imm12 = bits 11..0        (stores and branches, signed)
//   imm20 = bits 19..0        (JAL, signed)
// Branch and JAL offsets count instruction words from the following
// instruction. SYS 0 halts, SYS 1 writes r1 to the terminal port, SYS 2
// reads the terminal port into r1.

use crate::cpu::REG_NAMES_16;
use crate::memory::BusPtr;
use crate::mmio::TERM_DATA;
use crate::processor::{CpuKind, DebugSnapshot, EmulatorCpu, HaltReason, StepResult};

pub const LOAD_ADDR: u32 = 0x1000;

pub struct Ie32 {
    pub regs: [u32; 16],
    pub pc: u32,
    executed: u64,
    bus: BusPtr,
}

// Opcode bytes. The gaps are deliberate room for later extensions.
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
    pub const LD32: u32 = 0x22;
    pub const LD8S: u32 = 0x23;
    pub const LD16S: u32 = 0x24;
    pub const ST8: u32 = 0x28;
    pub const ST16: u32 = 0x29;
    pub const ST32: u32 = 0x2A;
    pub const BEQ: u32 = 0x30;
    pub const BNE: u32 = 0x31;
    pub const BLT: u32 = 0x32;
    pub const BGE: u32 = 0x33;
    pub const BLTU: u32 = 0x34;
    pub const BGEU: u32 = 0x35;
    pub const JAL: u32 = 0x38;
    pub const JALR: u32 = 0x39;
    pub const SYS: u32 = 0x3F;
}

#[inline]
fn simm16(word: u32) -> i32 {
    (word & 0xFFFF) as u16 as i16 as i32
}

#[inline]
fn simm12(word: u32) -> i32 {
    ((word & 0x0FFF) as i32) << 20 >> 20
}

#[inline]
fn simm20(word: u32) -> i32 {
    ((word & 0xF_FFFF) as i32) << 12 >> 12
}

impl Ie32 {
    pub fn new(bus: BusPtr) -> Ie32 {
        Ie32 { regs: [0; 16], pc: LOAD_ADDR, executed: 0, bus }
    }

    #[inline]
    fn set_reg(&mut self, rd: usize, value: u32) {
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
        self.pc = next;
        match word >> 24 {
            op::NOP => {}
            op::LUI => self.set_reg(rd, (word & 0xFFFF) << 16),
            op::ORI => self.set_reg(rd, a | (word & 0xFFFF)),
            op::ADDI => self.set_reg(rd, a.wrapping_add(simm16(word) as u32)),
            op::ADD => self.set_reg(rd, a.wrapping_add(b)),
            op::SUB => self.set_reg(rd, a.wrapping_sub(b)),
            op::AND => self.set_reg(rd, a & b),
            op::OR => self.set_reg(rd, a | b),
            op::XOR => self.set_reg(rd, a ^ b),
            op::SLL => self.set_reg(rd, a.wrapping_shl(b & 31)),
            op::SRL => self.set_reg(rd, a.wrapping_shr(b & 31)),
            op::SRA => self.set_reg(rd, (a as i32).wrapping_shr(b & 31) as u32),
            op::MUL => self.set_reg(rd, a.wrapping_mul(b)),
            op::DIVU => {
                if b == 0 {
                    return StepResult::Halted(HaltReason::DivisionByZero { pc: pc as u64 });
                }
                self.set_reg(rd, a / b);
            }
            op::SLT => self.set_reg(rd, ((a as i32) < (b as i32)) as u32),
            op::SLTU => self.set_reg(rd, (a < b) as u32),
            op::LD8U | op::LD16U | op::LD32 | op::LD8S | op::LD16S => {
                let addr = a.wrapping_add(simm16(word) as u32);
                let value = match word >> 24 {
                    op::LD8U => self.bus.read8(addr) as u32,
                    op::LD16U => self.bus.read16(addr) as u32,
                    op::LD8S => self.bus.read8(addr) as i8 as i32 as u32,
                    op::LD16S => self.bus.read16(addr) as i16 as i32 as u32,
                    _ => self.bus.read32(addr),
                };
                self.set_reg(rd, value);
            }
            op::ST8 | op::ST16 | op::ST32 => {
                let addr = a.wrapping_add(simm12(word) as u32);
                match word >> 24 {
                    op::ST8 => self.bus.write8(addr, b as u8),
                    op::ST16 => self.bus.write16(addr, b as u16),
                    _ => self.bus.write32(addr, b),
                }
            }
            op::BEQ | op::BNE | op::BLT | op::BGE | op::BLTU | op::BGEU => {
                let taken = match word >> 24 {
                    op::BEQ => a == b,
                    op::BNE => a != b,
                    op::BLT => (a as i32) < (b as i32),
                    op::BGE => (a as i32) >= (b as i32),
                    op::BLTU => a < b,
                    _ => a >= b,
                };
                if taken {
                    self.pc = next.wrapping_add((simm12(word) * 4) as u32);
                }
            }
            op::JAL => {
                self.set_reg(rd, next);
                self.pc = next.wrapping_add((simm20(word) * 4) as u32);
            }
            op::JALR => {
                let target = a.wrapping_add(simm12(word) as u32);
                self.set_reg(rd, next);
                self.pc = target;
            }
            op::SYS => match word & 0xFFFF {
                0 => return StepResult::Halted(HaltReason::Halted),
                1 => self.bus.write32(TERM_DATA, self.regs[1]),
                2 => {
                    let c = self.bus.read32(TERM_DATA);
                    self.set_reg(1, c);
                }
                _ => {
                    return StepResult::Halted(HaltReason::IllegalInstruction {
                        pc: pc as u64,
                        opcode: word,
                    })
                }
            },
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

impl EmulatorCpu for Ie32 {
    fn kind(&self) -> CpuKind {
        CpuKind::Ie32
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
        self.pc = LOAD_ADDR;
        self.executed = 0;
    }

    fn debug_snapshot(&self) -> DebugSnapshot {
        DebugSnapshot {
            kind: CpuKind::Ie32,
            pc: self.pc as u64,
            registers: REG_NAMES_16
                .iter()
                .zip(self.regs.iter())
                .map(|(name, value)| (*name, *value as u64))
                .collect(),
            flags: String::new(),
            instructions: self.executed,
        }
    }

    fn default_load_addr(&self) -> u32 {
        LOAD_ADDR
    }
}

/// Tiny assembler for the test suite and the SDK examples.
pub mod asm {
    pub fn r(op: u32, rd: u32, rs1: u32, rs2: u32) -> u32 {
        (op << 24) | (rd << 20) | (rs1 << 16) | (rs2 << 12)
    }
    pub fn i(op: u32, rd: u32, rs1: u32, imm16: u32) -> u32 {
        (op << 24) | (rd << 20) | (rs1 << 16) | (imm16 & 0xFFFF)
    }
    pub fn s(op: u32, rs1: u32, rs2: u32, imm12: i32) -> u32 {
        (op << 24) | (rs1 << 16) | (rs2 << 12) | (imm12 as u32 & 0xFFF)
    }
    pub fn b(op: u32, rs1: u32, rs2: u32, words: i32) -> u32 {
        (op << 24) | (rs1 << 16) | (rs2 << 12) | (words as u32 & 0xFFF)
    }
    pub fn jal(rd: u32, words: i32) -> u32 {
        (0x38 << 24) | (rd << 20) | (words as u32 & 0xF_FFFF)
    }
    pub const HALT: u32 = 0x3F << 24;
    pub const PUTC: u32 = (0x3F << 24) | 1;

    pub fn assemble(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::asm::*;
    use super::*;
    use crate::memory::Bus;

    fn run(words: &[u32]) -> Ie32 {
        let bus = Bus::new();
        let mut cpu = Ie32::new(bus);
        cpu.load_program(&assemble(words), LOAD_ADDR, LOAD_ADDR);
        for _ in 0..10_000 {
            if let StepResult::Halted(_) = cpu.step() {
                break;
            }
        }
        cpu
    }

    #[test]
    fn arithmetic_and_halt() {
        let cpu = run(&[
            i(0x03, 1, 0, 7),      // addi r1, r0, 7
            i(0x03, 2, 0, 5),      // addi r2, r0, 5
            r(0x10, 3, 1, 2),      // add r3, r1, r2
            r(0x18, 4, 3, 2),      // mul r4, r3, r2
            HALT,
        ]);
        assert_eq!(cpu.regs[3], 12);
        assert_eq!(cpu.regs[4], 60);
    }

    #[test]
    fn r0_is_hardwired_zero() {
        let cpu = run(&[i(0x03, 0, 0, 99), HALT]);
        assert_eq!(cpu.regs[0], 0);
    }

    #[test]
    fn loads_and_stores() {
        let cpu = run(&[
            i(0x01, 1, 0, 0x0002),    // lui r1, 0x0002 -> 0x20000
            i(0x03, 2, 0, 0x1234),    // addi r2, r0, 0x1234
            s(0x2A, 1, 2, 0),         // st32 [r1], r2
            i(0x22, 3, 1, 0),         // ld32 r3, [r1]
            i(0x20, 4, 1, 0),         // ld8u r4, [r1]
            HALT,
        ]);
        assert_eq!(cpu.regs[3], 0x1234);
        assert_eq!(cpu.regs[4], 0x34);
    }

    #[test]
    fn branch_loop_counts() {
        // r1 counts 0..5
        let cpu = run(&[
            i(0x03, 2, 0, 5),      // addi r2, r0, 5
            i(0x03, 1, 1, 1),      // addi r1, r1, 1
            b(0x31, 1, 2, -2),     // bne r1, r2, -2 words
            HALT,
        ]);
        assert_eq!(cpu.regs[1], 5);
    }

    #[test]
    fn division_by_zero_halts() {
        let bus = Bus::new();
        let mut cpu = Ie32::new(bus);
        cpu.load_program(&assemble(&[r(0x19, 1, 1, 0)]), LOAD_ADDR, LOAD_ADDR);
        match cpu.step() {
            StepResult::Halted(HaltReason::DivisionByZero { pc }) => {
                assert_eq!(pc, LOAD_ADDR as u64)
            }
            other => panic!("expected division fault, got {other:?}"),
        }
    }

    #[test]
    fn reset_clears_state() {
        let mut cpu = run(&[i(0x03, 1, 0, 7), HALT]);
        cpu.reset();
        assert_eq!(cpu.regs[1], 0);
        assert_eq!(cpu.debug_snapshot().instructions, 0);
    }
}
