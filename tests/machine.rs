// Whole-machine tests: boot programs on several cores through the
// lifecycle controller with headless sinks, and check the reset
// guarantees hold across mode switches.

use intuition_engine::audio::AudioSink;
use intuition_engine::cpu::ie32::asm;
use intuition_engine::{BootRequest, CpuKind, Machine};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct NullAudio;
impl AudioSink for NullAudio {
    fn write(&mut self, interleaved: &[f32]) {
        let frames = interleaved.len() / 2;
        std::thread::sleep(Duration::from_micros(frames as u64 * 1_000_000 / 44_100));
    }
}

fn machine() -> Arc<Machine> {
    Machine::new(std::env::temp_dir(), Box::new(|| Box::new(NullAudio)))
}

fn write_program(name: &str, bytes: &[u8]) -> PathBuf {
    let dir = std::env::temp_dir().join("intuition-machine-tests");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

fn wait_for_halt(machine: &Arc<Machine>) {
    let control = machine.cpu_control().expect("machine is running");
    let deadline = Instant::now() + Duration::from_secs(5);
    while !control.finished.load(Ordering::Acquire) {
        assert!(Instant::now() < deadline, "program failed to halt in time");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn ie32_program_writes_through_the_bus() {
    let machine = machine();
    // Store 0x1234 at 0x20000, then halt.
    let path = write_program(
        "store.iex",
        &asm::assemble(&[
            asm::i(0x01, 1, 0, 0x0002), // lui r1 -> 0x20000
            asm::i(0x03, 2, 0, 0x1234),
            asm::s(0x2A, 1, 2, 0),
            asm::HALT,
        ]),
    );
    machine
        .run_program_with_full_reset(BootRequest {
            cpu: CpuKind::Ie32,
            program: Some(path),
            ..BootRequest::default()
        })
        .unwrap();
    wait_for_halt(&machine);
    assert_eq!(machine.bus.read32(0x20000), 0x1234);
    machine.shutdown();
}

#[test]
fn mode_switch_zeroes_ram_and_counters() {
    let machine = machine();
    let ie32 = write_program(
        "first.iex",
        &asm::assemble(&[
            asm::i(0x01, 1, 0, 0x0003), // lui r1 -> 0x30000
            asm::i(0x03, 2, 0, 77),
            asm::s(0x2A, 1, 2, 0),
            asm::HALT,
        ]),
    );
    machine
        .run_program_with_full_reset(BootRequest {
            cpu: CpuKind::Ie32,
            program: Some(ie32),
            ..BootRequest::default()
        })
        .unwrap();
    wait_for_halt(&machine);
    assert_eq!(machine.bus.read32(0x30000), 77);

    // Switch to a 6502 program; the old machine's footprint must be gone.
    let mut prg = vec![0x00, 0x06]; // PRG prelude -> $0600
    prg.extend_from_slice(&[0xA9, 0x2A, 0x8D, 0x00, 0x20, 0x00]); // LDA #42 / STA $2000 / BRK
    let m6502 = write_program("second.ie65", &prg);
    machine
        .run_program_with_full_reset(BootRequest {
            cpu: CpuKind::Mos6502,
            program: Some(m6502),
            ..BootRequest::default()
        })
        .unwrap();
    wait_for_halt(&machine);
    assert_eq!(machine.bus.read32(0x30000), 0, "old program state must be zeroed");
    assert_eq!(machine.bus.read8(0x2000), 42);
    machine.shutdown();
}

#[test]
fn z80_machine_runs_and_halts() {
    let machine = machine();
    // LD A,9 / LD (0x9000),A / HALT at the Z80 default load address.
    let path = write_program("prog.ie80", &[0x3E, 0x09, 0x32, 0x00, 0x90, 0x76]);
    machine
        .run_program_with_full_reset(BootRequest {
            cpu: CpuKind::Z80,
            program: Some(path),
            ..BootRequest::default()
        })
        .unwrap();
    wait_for_halt(&machine);
    assert_eq!(machine.bus.read8(0x9000), 9);
    machine.shutdown();
}

#[test]
fn x86_machine_runs_and_halts() {
    let machine = machine();
    // mov eax, 0xBEEF / mov [0x2100], eax / hlt
    let path = write_program(
        "prog.ie86",
        &[
            0xB8, 0xEF, 0xBE, 0x00, 0x00, //
            0x89, 0x05, 0x00, 0x21, 0x00, 0x00, //
            0xF4,
        ],
    );
    machine
        .run_program_with_full_reset(BootRequest {
            cpu: CpuKind::X86,
            program: Some(path),
            ..BootRequest::default()
        })
        .unwrap();
    wait_for_halt(&machine);
    assert_eq!(machine.bus.read32(0x2100), 0xBEEF);
    machine.shutdown();
}

#[test]
fn m68k_machine_stores_big_endian() {
    let machine = machine();
    // MOVE.L #$11223344,$00002200.L / TRAP #15
    let words: [u16; 6] = [0x23FC, 0x1122, 0x3344, 0x0000, 0x2200, 0x4E4F];
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    let path = write_program("prog.ie68", &bytes);
    machine
        .run_program_with_full_reset(BootRequest {
            cpu: CpuKind::M68k,
            program: Some(path),
            ..BootRequest::default()
        })
        .unwrap();
    wait_for_halt(&machine);
    // The bus stores little-endian, so the 68K's big-endian store reads
    // back byte-reversed through a little-endian view.
    assert_eq!(machine.bus.read8(0x2200), 0x11);
    assert_eq!(machine.bus.read32(0x2200), 0x4433_2211);
    machine.shutdown();
}

#[test]
fn guest_can_poll_vblank_through_the_fast_path() {
    let machine = machine();
    // Spin until VIDEO_STATUS bit 1 rises, then store a flag and halt.
    let path = write_program(
        "vblank.iex",
        &asm::assemble(&[
            asm::i(0x01, 1, 0, 0x01F3),         // lui r1 -> 0x01F30000
            asm::i(0x22, 2, 1, 0x0004),         // ld32 r2, [r1+4]
            asm::i(0x03, 3, 0, 2),              // addi r3, r0, 2
            asm::r(0x12, 2, 2, 3),              // and r2, r2, r3
            asm::b(0x30, 2, 0, -4),             // beq r2, r0, back to the load
            asm::i(0x03, 4, 0, 1),              // addi r4, r0, 1
            asm::s(0x2A, 0, 4, 0x100),          // st32 [0x100], r4
            asm::HALT,
        ]),
    );
    machine
        .run_program_with_full_reset(BootRequest {
            cpu: CpuKind::Ie32,
            program: Some(path),
            ..BootRequest::default()
        })
        .unwrap();
    wait_for_halt(&machine);
    assert_eq!(machine.bus.read32(0x100), 1, "VBlank poll must complete");
    machine.shutdown();
}
