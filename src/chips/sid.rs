// MOS 6581/8580 SID engine. The three voices map onto synth channels
// 0..2 with the SID's own ring-mod and hard-sync topology (voice N is
// modulated by voice N-1, wrapping); the chip's filter block programs
// the engine's global filter. 6581 voices carry the ADSR delay bug,
// 8580 voices expose none.

use crate::audio::{AudioEngine, ChipEvent, SampleTicker, Waveform, SAMPLE_RATE};
use crate::chips::EventQueue;
use crate::devices::{Device, MemoryRange};
use crate::mmio::{PLAYER_CTRL, PLAYER_STATUS, SID_BASE, SID_LIMIT};
use crate::audio::{FILTER_BP, FILTER_HP, FILTER_LP, FILTER_OFF};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const PAL_CLOCK: f64 = 985_248.0;
pub const NTSC_CLOCK: f64 = 1_022_727.0;

const VOICES: usize = 3;
const VOICE_REGS: usize = 7;

// Attack times in milliseconds for the 4-bit rate nibble; decay and
// release are three times slower, as on the real part.
const ATTACK_MS: [u32; 16] = [
    2, 8, 16, 24, 38, 56, 68, 80, 100, 250, 500, 800, 1000, 3000, 5000, 8000,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidModel {
    Mos6581,
    Mos8580,
}

pub struct Sid {
    regs: Mutex<[u8; 32]>,
    queue: EventQueue,
    engine: Arc<AudioEngine>,
    clock_bits: AtomicU64,
    model_8580: AtomicBool,
    plus: AtomicBool,
    playing: AtomicBool,
}

impl Sid {
    pub fn new(engine: Arc<AudioEngine>, clock_hz: f64, model: SidModel) -> Arc<Sid> {
        Arc::new(Sid {
            regs: Mutex::new([0; 32]),
            queue: EventQueue::new(),
            engine,
            clock_bits: AtomicU64::new(clock_hz.to_bits()),
            model_8580: AtomicBool::new(model == SidModel::Mos8580),
            plus: AtomicBool::new(false),
            playing: AtomicBool::new(false),
        })
    }

    /// PAL/NTSC selection; applies to registers written afterwards.
    pub fn set_clock(&self, clock_hz: f64) {
        self.clock_bits.store(clock_hz.to_bits(), Ordering::Relaxed);
    }

    pub fn set_model(&self, model: SidModel) {
        self.model_8580.store(model == SidModel::Mos8580, Ordering::Relaxed);
    }

    fn clock_hz(&self) -> f64 {
        f64::from_bits(self.clock_bits.load(Ordering::Relaxed))
    }

    pub fn set_plus(&self, on: bool) {
        self.plus.store(on, Ordering::Relaxed);
    }

    pub fn enqueue(&self, event: ChipEvent) {
        self.queue.push(event);
    }

    fn ms_to_samples(ms: u32) -> u32 {
        (ms as u64 * SAMPLE_RATE as u64 / 1000) as u32
    }

    fn apply(&self, register: u8, value: u8) {
        let mut regs = self.regs.lock().unwrap();
        if register as usize >= regs.len() {
            return;
        }
        regs[register as usize] = value;
        let plus = self.plus.load(Ordering::Relaxed);

        for voice in 0..VOICES {
            let base = voice * VOICE_REGS;
            let channel = &self.engine.channels[voice];

            let freq_reg = regs[base] as u32 | ((regs[base + 1] as u32) << 8);
            channel.set_frequency((freq_reg as f64 * self.clock_hz() / 16_777_216.0) as f32);

            let pw = (regs[base + 2] as u32 | ((regs[base + 3] as u32 & 0x0F) << 8)) as f32;
            channel.set_duty(pw / 4096.0);

            let control = regs[base + 4];
            let wave_bits = control >> 4;
            match wave_bits {
                0b0001 => channel.set_waveform(Waveform::Triangle),
                0b0010 => channel.set_waveform(Waveform::Sawtooth),
                0b0100 => channel.set_waveform(Waveform::Square),
                0b1000 => channel.set_waveform(Waveform::Noise),
                0 => {}
                _ => {
                    channel.set_waveform(Waveform::Combined);
                    channel.set_wave_mask(wave_bits as u32);
                }
            }

            // Voice N takes voice N-1 (wrapping) as its modulation
            // source, exactly the chip's topology.
            let source = ((voice + VOICES - 1) % VOICES) as u8;
            channel.set_ring_source((control & 0x04 != 0).then_some(source));
            channel.set_sync_source((control & 0x02 != 0).then_some(source));

            let ad = regs[base + 5];
            let sr = regs[base + 6];
            channel.set_adsr(
                Self::ms_to_samples(ATTACK_MS[(ad >> 4) as usize]),
                Self::ms_to_samples(ATTACK_MS[(ad & 0x0F) as usize] * 3),
                (sr >> 4) as f32 / 15.0,
                Self::ms_to_samples(ATTACK_MS[(sr & 0x0F) as usize] * 3),
            );
            channel.set_model_8580(self.model_8580.load(Ordering::Relaxed));
            channel.set_enhanced(plus);
            channel.set_gate(control & 0x01 != 0 && control & 0x08 == 0); // test bit silences

            // The per-voice filter sweep survives in SID+ mode.
            let filt = regs[0x17];
            if filt & (1 << voice) != 0 {
                let cutoff =
                    ((regs[0x15] as u32 & 0x07) | ((regs[0x16] as u32) << 3)) as f32 / 2047.0;
                channel.set_filter(cutoff, (filt >> 4) as f32 / 15.0);
            } else {
                channel.set_filter(0.0, 0.0);
            }
        }

        // Master volume and filter mode program the global block.
        let mode_vol = regs[0x18];
        let master = (mode_vol & 0x0F) as f32 / 15.0;
        for voice in 0..VOICES {
            self.engine.channels[voice].set_volume(master);
        }
        let cutoff = ((regs[0x15] as u32 & 0x07) | ((regs[0x16] as u32) << 3)) as f32 / 2047.0;
        let resonance = (regs[0x17] >> 4) as f32 / 15.0;
        let mode = if mode_vol & 0x10 != 0 {
            FILTER_LP
        } else if mode_vol & 0x20 != 0 {
            FILTER_BP
        } else if mode_vol & 0x40 != 0 {
            FILTER_HP
        } else {
            FILTER_OFF
        };
        self.engine.global.set_filter(mode, cutoff, resonance);
    }

    fn silence(&self) {
        for voice in 0..VOICES {
            let channel = &self.engine.channels[voice];
            channel.set_gate(false);
            channel.set_volume(0.0);
            channel.set_ring_source(None);
            channel.set_sync_source(None);
        }
        self.engine.global.set_filter(FILTER_OFF, 1.0, 0.0);
    }
}

impl SampleTicker for Sid {
    fn name(&self) -> &'static str {
        "sid"
    }

    fn tick(&self, sample_clock: u64) {
        self.queue.drain(sample_clock, |register, value| self.apply(register, value));
    }

    fn reset(&self) {
        self.queue.clear();
        *self.regs.lock().unwrap() = [0; 32];
        self.playing.store(false, Ordering::Relaxed);
        self.silence();
    }
}

impl Device for Sid {
    fn memconfig(&self) -> MemoryRange {
        vec![(SID_BASE, SID_LIMIT)]
    }

    fn read32(&self, addr: u32) -> u32 {
        match addr - SID_BASE {
            PLAYER_CTRL => self.plus.load(Ordering::Relaxed) as u32,
            PLAYER_STATUS => self.playing.load(Ordering::Relaxed) as u32,
            offset if offset < 32 => self.regs.lock().unwrap()[offset as usize] as u32,
            _ => 0,
        }
    }

    fn write32(&self, addr: u32, value: u32) {
        match addr - SID_BASE {
            PLAYER_CTRL => {
                self.playing.store(value & 1 != 0, Ordering::Relaxed);
                self.plus.store(value & 2 != 0, Ordering::Relaxed);
                if value & 1 == 0 {
                    self.silence();
                }
            }
            offset if offset < 32 => self.queue.push(ChipEvent {
                sample_offset: self.engine.current_sample(),
                register: offset as u8,
                value: value as u8,
            }),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequency_register_maps_to_hertz() {
        let engine = AudioEngine::new();
        let sid = Sid::new(Arc::clone(&engine), PAL_CLOCK, SidModel::Mos6581);
        // 0x1CD6 is close to A-4 (440 Hz) on a PAL chip.
        sid.apply(0x00, 0xD6);
        sid.apply(0x01, 0x1C);
        sid.apply(0x04, 0x11); // gate + triangle
        sid.apply(0x18, 0x0F); // full master volume
        let freq = engine.channels[0].frequency();
        assert!((freq - 433.0).abs() < 5.0, "frequency was {freq}");
        assert!(engine.channels[0].gate());
    }

    #[test]
    fn ring_bit_wires_previous_voice() {
        let engine = AudioEngine::new();
        let sid = Sid::new(Arc::clone(&engine), PAL_CLOCK, SidModel::Mos6581);
        // Voice 1 control: gate + triangle + ring.
        sid.apply(0x04 + 7, 0x15);
        assert_eq!(
            engine.channels[1].ring_source(),
            Some(0),
            "voice 1 must ring against voice 0"
        );
        // Voice 0 rings against voice 2.
        sid.apply(0x04, 0x15);
        assert_eq!(engine.channels[0].ring_source(), Some(2));
    }

    #[test]
    fn model_selects_adsr_bug() {
        let engine = AudioEngine::new();
        let sid = Sid::new(Arc::clone(&engine), PAL_CLOCK, SidModel::Mos8580);
        sid.apply(0x04, 0x11);
        assert!(engine.channels[0].is_model_8580());
    }
}
