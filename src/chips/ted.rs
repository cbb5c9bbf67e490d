// Plus/4 TED sound engine: two tone generators, the second switchable
// to noise, mapped onto synth channels 0..1. Frequencies follow the
// PAL TED divider.

use crate::audio::{AudioEngine, ChipEvent, SampleTicker, Waveform};
use crate::chips::EventQueue;
use crate::devices::{Device, MemoryRange};
use crate::mmio::{PLAYER_CTRL, PLAYER_STATUS, TED_SOUND_BASE, TED_SOUND_LIMIT};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const TED_RATE: f64 = 111_860.78125; // PAL single-clock rate

const REG_FREQ1_LO: usize = 0;
const REG_FREQ1_HI: usize = 1;
const REG_FREQ2_LO: usize = 2;
const REG_FREQ2_HI: usize = 3;
const REG_CTRL: usize = 4;

pub struct TedSound {
    regs: Mutex<[u8; 5]>,
    queue: EventQueue,
    engine: Arc<AudioEngine>,
    plus: AtomicBool,
    playing: AtomicBool,
}

impl TedSound {
    pub fn new(engine: Arc<AudioEngine>) -> Arc<TedSound> {
        Arc::new(TedSound {
            regs: Mutex::new([0; 5]),
            queue: EventQueue::new(),
            engine,
            plus: AtomicBool::new(false),
            playing: AtomicBool::new(false),
        })
    }

    pub fn set_plus(&self, on: bool) {
        self.plus.store(on, Ordering::Relaxed);
    }

    pub fn enqueue(&self, event: ChipEvent) {
        self.queue.push(event);
    }

    fn apply(&self, register: u8, value: u8) {
        let mut regs = self.regs.lock().unwrap();
        if register as usize >= regs.len() {
            return;
        }
        regs[register as usize] = value;
        let ctrl = regs[REG_CTRL];
        let volume = (ctrl & 0x0F).min(8) as f32 / 8.0;
        let plus = self.plus.load(Ordering::Relaxed);

        for voice in 0..2 {
            let channel = &self.engine.channels[voice];
            let (lo, hi) = if voice == 0 {
                (regs[REG_FREQ1_LO], regs[REG_FREQ1_HI])
            } else {
                (regs[REG_FREQ2_LO], regs[REG_FREQ2_HI])
            };
            let period = (lo as u32 | ((hi as u32 & 0x03) << 8)).min(1023);
            channel.set_frequency((TED_RATE / (1024 - period) as f64) as f32);

            let noise = voice == 1 && ctrl & 0x40 != 0;
            channel.set_waveform(if noise { Waveform::Noise } else { Waveform::Square });
            channel.set_duty(0.5);
            channel.set_enhanced(plus);
            channel.set_adsr(0, 0, 1.0, 0);
            channel.set_volume(volume);

            let enabled = ctrl & (0x10 << voice) != 0;
            channel.set_gate(enabled && volume > 0.0);
        }
    }

    fn silence(&self) {
        for voice in 0..2 {
            let channel = &self.engine.channels[voice];
            channel.set_gate(false);
            channel.set_volume(0.0);
        }
    }
}

impl SampleTicker for TedSound {
    fn name(&self) -> &'static str {
        "ted-sound"
    }

    fn tick(&self, sample_clock: u64) {
        self.queue.drain(sample_clock, |register, value| self.apply(register, value));
    }

    fn reset(&self) {
        self.queue.clear();
        *self.regs.lock().unwrap() = [0; 5];
        self.playing.store(false, Ordering::Relaxed);
        self.silence();
    }
}

impl Device for TedSound {
    fn memconfig(&self) -> MemoryRange {
        vec![(TED_SOUND_BASE, TED_SOUND_LIMIT)]
    }

    fn read32(&self, addr: u32) -> u32 {
        match addr - TED_SOUND_BASE {
            PLAYER_CTRL => self.plus.load(Ordering::Relaxed) as u32,
            PLAYER_STATUS => self.playing.load(Ordering::Relaxed) as u32,
            offset if offset < 5 => self.regs.lock().unwrap()[offset as usize] as u32,
            _ => 0,
        }
    }

    fn write32(&self, addr: u32, value: u32) {
        match addr - TED_SOUND_BASE {
            PLAYER_CTRL => {
                self.playing.store(value & 1 != 0, Ordering::Relaxed);
                self.plus.store(value & 2 != 0, Ordering::Relaxed);
                if value & 1 == 0 {
                    self.silence();
                }
            }
            offset if offset < 5 => self.queue.push(ChipEvent {
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
    fn tone_and_volume() {
        let engine = AudioEngine::new();
        let ted = TedSound::new(Arc::clone(&engine));
        // Period 910 -> about 981 Hz.
        ted.apply(REG_FREQ1_LO as u8, (910 & 0xFF) as u8);
        ted.apply(REG_FREQ1_HI as u8, (910 >> 8) as u8);
        ted.apply(REG_CTRL as u8, 0x18); // channel 1 on, volume 8
        let freq = engine.channels[0].frequency();
        assert!((freq - 981.0).abs() < 10.0, "frequency was {freq}");
        assert!(engine.channels[0].gate());
        assert_eq!(engine.channels[0].volume(), 1.0);
    }

    #[test]
    fn channel_two_noise_mode() {
        let engine = AudioEngine::new();
        let ted = TedSound::new(Arc::clone(&engine));
        ted.apply(REG_FREQ2_LO as u8, 0x40);
        ted.apply(REG_CTRL as u8, 0x68); // channel 2 on, noise, volume 8
        assert!(engine.channels[1].gate());
    }
}
