// AY/YM programmable sound generator engine. Three tone channels and
// the shared noise generator map onto synth channels 0..3; the envelope
// generator is folded into the synth's ADSR rather than re-simulated.

use crate::audio::{AudioEngine, ChipEvent, SampleTicker, Waveform, SAMPLE_RATE};
use crate::chips::EventQueue;
use crate::devices::{Device, MemoryRange};
use crate::mmio::{PLAYER_CTRL, PLAYER_STATUS, PSG_BASE, PSG_LIMIT};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const PSG_CLOCK: f64 = 1_773_400.0; // PAL
const TONE_CHANNELS: usize = 3;
const NOISE_CHANNEL: usize = 3;

// 4-bit volume to linear amplitude, roughly the AY's 3 dB ladder.
const VOLUME_TABLE: [f32; 16] = [
    0.0, 0.008, 0.011, 0.016, 0.023, 0.033, 0.047, 0.067, 0.095, 0.134, 0.190, 0.269, 0.380,
    0.537, 0.759, 1.0,
];

pub struct Psg {
    regs: Mutex<[u8; 16]>,
    queue: EventQueue,
    engine: Arc<AudioEngine>,
    plus: AtomicBool,
    playing: AtomicBool,
}

impl Psg {
    pub fn new(engine: Arc<AudioEngine>) -> Arc<Psg> {
        Arc::new(Psg {
            regs: Mutex::new([0; 16]),
            queue: EventQueue::new(),
            engine,
            plus: AtomicBool::new(false),
            playing: AtomicBool::new(false),
        })
    }

    pub fn set_plus(&self, on: bool) {
        self.plus.store(on, Ordering::Relaxed);
    }

    /// Queue a register write aimed at an explicit sample time; players
    /// emit these in ascending order.
    pub fn enqueue(&self, event: ChipEvent) {
        self.queue.push(event);
    }

    fn apply(&self, register: u8, value: u8) {
        let mut regs = self.regs.lock().unwrap();
        if register as usize >= regs.len() {
            return;
        }
        regs[register as usize] = value;
        let plus = self.plus.load(Ordering::Relaxed);
        let mixer = regs[7];

        for voice in 0..TONE_CHANNELS {
            let period =
                (regs[voice * 2] as u32 | ((regs[voice * 2 + 1] as u32 & 0x0F) << 8)).max(1);
            let channel = &self.engine.channels[voice];
            channel.set_frequency((PSG_CLOCK / (16.0 * period as f64)) as f32);
            channel.set_waveform(Waveform::Square);
            channel.set_duty(0.5);
            channel.set_enhanced(plus);

            let vol_reg = regs[8 + voice];
            let tone_enabled = mixer & (1 << voice) == 0;
            if vol_reg & 0x10 != 0 {
                // Envelope-driven volume: express the shape through the
                // synth ADSR. Continue/attack shapes ramp up, the rest
                // decay from full.
                let env_period =
                    (regs[11] as u32 | ((regs[12] as u32) << 8)).max(1);
                let env_samples =
                    (env_period as f64 * 256.0 / PSG_CLOCK * SAMPLE_RATE as f64) as u32;
                let shape = regs[13] & 0x0F;
                if shape & 0x04 != 0 {
                    channel.set_adsr(env_samples, 0, 1.0, env_samples);
                } else {
                    channel.set_adsr(0, env_samples, 0.0, env_samples);
                }
                channel.set_volume(1.0);
                channel.set_gate(tone_enabled);
            } else {
                channel.set_adsr(0, 0, 1.0, 0);
                channel.set_volume(VOLUME_TABLE[(vol_reg & 0x0F) as usize]);
                channel.set_gate(tone_enabled);
            }
        }

        // Shared noise generator on the fourth channel: loudest enabled
        // voice sets its level.
        let noise_period = (regs[6] & 0x1F).max(1) as f64;
        let noise = &self.engine.channels[NOISE_CHANNEL];
        noise.set_frequency((PSG_CLOCK / (16.0 * noise_period)) as f32);
        noise.set_waveform(Waveform::Noise);
        noise.set_enhanced(plus);
        let mut noise_volume = 0.0f32;
        for voice in 0..TONE_CHANNELS {
            if mixer & (1 << (voice + 3)) == 0 {
                noise_volume = noise_volume.max(VOLUME_TABLE[(regs[8 + voice] & 0x0F) as usize]);
            }
        }
        noise.set_adsr(0, 0, 1.0, 0);
        noise.set_volume(noise_volume);
        noise.set_gate(noise_volume > 0.0);
    }

    fn silence(&self) {
        for voice in 0..=NOISE_CHANNEL {
            let channel = &self.engine.channels[voice];
            channel.set_gate(false);
            channel.set_volume(0.0);
        }
    }
}

impl SampleTicker for Psg {
    fn name(&self) -> &'static str {
        "psg"
    }

    fn tick(&self, sample_clock: u64) {
        self.queue.drain(sample_clock, |register, value| self.apply(register, value));
    }

    fn reset(&self) {
        self.queue.clear();
        *self.regs.lock().unwrap() = [0; 16];
        self.playing.store(false, Ordering::Relaxed);
        self.silence();
    }
}

impl Device for Psg {
    fn memconfig(&self) -> MemoryRange {
        vec![(PSG_BASE, PSG_LIMIT)]
    }

    fn read32(&self, addr: u32) -> u32 {
        match addr - PSG_BASE {
            PLAYER_CTRL => self.plus.load(Ordering::Relaxed) as u32, // mirrors the plus bit
            PLAYER_STATUS => self.playing.load(Ordering::Relaxed) as u32,
            offset if offset < 16 => self.regs.lock().unwrap()[offset as usize] as u32,
            _ => 0,
        }
    }

    fn write32(&self, addr: u32, value: u32) {
        match addr - PSG_BASE {
            PLAYER_CTRL => {
                self.playing.store(value & 1 != 0, Ordering::Relaxed);
                self.plus.store(value & 2 != 0, Ordering::Relaxed);
                if value & 1 == 0 {
                    self.silence();
                }
            }
            offset if offset < 16 => self.queue.push(ChipEvent {
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
    fn tone_register_sets_channel_frequency() {
        let engine = AudioEngine::new();
        let psg = Psg::new(Arc::clone(&engine));
        // Period 0x11C (284) on channel A -> about 390 Hz.
        psg.apply(0, 0x1C);
        psg.apply(1, 0x01);
        psg.apply(8, 0x0F); // full volume
        psg.apply(7, 0b1111_1110); // tone A enabled, everything else off
        let freq = engine.channels[0].frequency();
        assert!((freq - 390.0).abs() < 5.0, "frequency was {freq}");
        assert!(engine.channels[0].gate());
        assert_eq!(engine.channels[0].volume(), 1.0);
    }

    #[test]
    fn events_apply_only_when_clock_reaches_them() {
        let engine = AudioEngine::new();
        let psg = Psg::new(Arc::clone(&engine));
        psg.enqueue(ChipEvent { sample_offset: 100, register: 8, value: 0x0F });
        psg.enqueue(ChipEvent { sample_offset: 100, register: 7, value: 0xFE });
        psg.tick(99);
        assert!(!engine.channels[0].gate());
        psg.tick(100);
        assert!(engine.channels[0].gate());
    }
}
