// Atari POKEY engine. Four audio channels map straight onto synth
// channels 0..3; AUDCTL picks the base clock, AUDC distortion selects
// pure tone versus polynomial noise.

use crate::audio::{AudioEngine, ChipEvent, SampleTicker, Waveform};
use crate::chips::EventQueue;
use crate::devices::{Device, MemoryRange};
use crate::mmio::{PLAYER_CTRL, PLAYER_STATUS, POKEY_BASE, POKEY_LIMIT};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const CLOCK_179: f64 = 1_789_790.0;
const CLOCK_64K: f64 = 63_921.0;
const CLOCK_15K: f64 = 15_699.0;

const AUDF: [usize; 4] = [0, 2, 4, 6];
const AUDC: [usize; 4] = [1, 3, 5, 7];
const AUDCTL: usize = 8;

pub struct Pokey {
    regs: Mutex<[u8; 9]>,
    queue: EventQueue,
    engine: Arc<AudioEngine>,
    plus: AtomicBool,
    playing: AtomicBool,
}

impl Pokey {
    pub fn new(engine: Arc<AudioEngine>) -> Arc<Pokey> {
        Arc::new(Pokey {
            regs: Mutex::new([0; 9]),
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
        let audctl = regs[AUDCTL];
        let base = if audctl & 0x01 != 0 { CLOCK_15K } else { CLOCK_64K };
        let plus = self.plus.load(Ordering::Relaxed);

        for voice in 0..4 {
            let channel = &self.engine.channels[voice];
            // Channels 1 and 3 can run from the 1.79 MHz clock.
            let clock = match voice {
                0 if audctl & 0x40 != 0 => CLOCK_179,
                2 if audctl & 0x20 != 0 => CLOCK_179,
                _ => base,
            };
            let divisor = regs[AUDF[voice]] as f64 + 1.0;
            channel.set_frequency((clock / (2.0 * divisor)) as f32);

            let audc = regs[AUDC[voice]];
            let distortion = audc >> 4;
            // 0xA and 0xE are the pure-tone settings; everything else
            // runs a polynomial counter we render as noise.
            if distortion & 0x02 != 0 {
                channel.set_waveform(Waveform::Square);
                channel.set_duty(0.5);
            } else {
                channel.set_waveform(Waveform::Noise);
            }
            channel.set_enhanced(plus);
            channel.set_adsr(0, 0, 1.0, 0);
            let volume = (audc & 0x0F) as f32 / 15.0;
            channel.set_volume(volume);
            channel.set_gate(volume > 0.0);
        }
    }

    fn silence(&self) {
        for voice in 0..4 {
            let channel = &self.engine.channels[voice];
            channel.set_gate(false);
            channel.set_volume(0.0);
        }
    }
}

impl SampleTicker for Pokey {
    fn name(&self) -> &'static str {
        "pokey"
    }

    fn tick(&self, sample_clock: u64) {
        self.queue.drain(sample_clock, |register, value| self.apply(register, value));
    }

    fn reset(&self) {
        self.queue.clear();
        *self.regs.lock().unwrap() = [0; 9];
        self.playing.store(false, Ordering::Relaxed);
        self.silence();
    }
}

impl Device for Pokey {
    fn memconfig(&self) -> MemoryRange {
        vec![(POKEY_BASE, POKEY_LIMIT)]
    }

    fn read32(&self, addr: u32) -> u32 {
        match addr - POKEY_BASE {
            PLAYER_CTRL => self.plus.load(Ordering::Relaxed) as u32,
            PLAYER_STATUS => self.playing.load(Ordering::Relaxed) as u32,
            offset if offset < 9 => self.regs.lock().unwrap()[offset as usize] as u32,
            _ => 0,
        }
    }

    fn write32(&self, addr: u32, value: u32) {
        match addr - POKEY_BASE {
            PLAYER_CTRL => {
                self.playing.store(value & 1 != 0, Ordering::Relaxed);
                self.plus.store(value & 2 != 0, Ordering::Relaxed);
                if value & 1 == 0 {
                    self.silence();
                }
            }
            offset if offset < 9 => self.queue.push(ChipEvent {
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
    fn pure_tone_frequency() {
        let engine = AudioEngine::new();
        let pokey = Pokey::new(Arc::clone(&engine));
        pokey.apply(AUDF[0] as u8, 63); // 64k clock / (2 * 64) -> ~499 Hz
        pokey.apply(AUDC[0] as u8, 0xAF); // pure tone, full volume
        let freq = engine.channels[0].frequency();
        assert!((freq - 499.0).abs() < 5.0, "frequency was {freq}");
        assert!(engine.channels[0].gate());
    }

    #[test]
    fn fast_clock_channel_one() {
        let engine = AudioEngine::new();
        let pokey = Pokey::new(Arc::clone(&engine));
        pokey.apply(AUDCTL as u8, 0x40);
        pokey.apply(AUDF[0] as u8, 255);
        pokey.apply(AUDC[0] as u8, 0xA8);
        let freq = engine.channels[0].frequency();
        assert!((freq - 3495.0).abs() < 20.0, "frequency was {freq}");
    }
}
