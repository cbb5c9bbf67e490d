// Amiga AHX engine: four tracker voices on the synth's flexible
// channels 5..8. Periods are Amiga PAL periods; AHX+ engages the
// classic L-R-R-L stereo spread and hardware-PWM emulation, where the
// square duty is swept by a per-voice LFO every sample.
//
// The format's "track 0 saved" flag follows the reference player: bit 7
// set means track 0 was NOT saved with the module.

use crate::audio::{AudioEngine, ChipEvent, SampleTicker, Waveform};
use crate::chips::EventQueue;
use crate::devices::{Device, MemoryRange};
use crate::mmio::{AHX_BASE, AHX_LIMIT, PLAYER_CTRL, PLAYER_STATUS};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

const AMIGA_CLOCK: f64 = 3_546_895.0; // PAL
const VOICES: usize = 4;
/// AHX owns the four flexible synth channels.
const CHANNEL_MAP: [usize; VOICES] = [5, 6, 7, 8];
const PAN_LRRL: [f32; VOICES] = [-0.6, 0.6, 0.6, -0.6];

const REG_STRIDE: usize = 8;
const REG_PERIOD_LO: usize = 0;
const REG_PERIOD_HI: usize = 1;
const REG_VOLUME: usize = 2;
const REG_WAVEFORM: usize = 3;
const REG_PWM_DEPTH: usize = 4;
const REG_PWM_RATE: usize = 5;

const REG_FLAGS: usize = 0x41;
const FLAG_TRACK0_NOT_SAVED: u8 = 0x80;

struct PwmState {
    phase: f64,
}

pub struct Ahx {
    regs: Mutex<[u8; 0x48]>,
    pwm: Mutex<[PwmState; VOICES]>,
    queue: EventQueue,
    engine: Arc<AudioEngine>,
    plus: AtomicBool,
    playing: AtomicBool,
    flags: AtomicU8,
}

impl Ahx {
    pub fn new(engine: Arc<AudioEngine>) -> Arc<Ahx> {
        Arc::new(Ahx {
            regs: Mutex::new([0; 0x48]),
            pwm: Mutex::new(std::array::from_fn(|_| PwmState { phase: 0.0 })),
            queue: EventQueue::new(),
            engine,
            plus: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            flags: AtomicU8::new(0),
        })
    }

    pub fn set_plus(&self, on: bool) {
        self.plus.store(on, Ordering::Relaxed);
    }

    pub fn enqueue(&self, event: ChipEvent) {
        self.queue.push(event);
    }

    /// Whether the module's subsong zero is present.
    pub fn track0_saved(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & FLAG_TRACK0_NOT_SAVED == 0
    }

    fn apply(&self, register: u8, value: u8) {
        let mut regs = self.regs.lock().unwrap();
        let index = register as usize;
        if index >= regs.len() {
            return;
        }
        regs[index] = value;
        if index == REG_FLAGS {
            self.flags.store(value, Ordering::Relaxed);
            return;
        }
        if index >= VOICES * REG_STRIDE {
            return;
        }
        let voice = index / REG_STRIDE;
        let base = voice * REG_STRIDE;
        let channel = &self.engine.channels[CHANNEL_MAP[voice]];
        let plus = self.plus.load(Ordering::Relaxed);

        let period =
            (regs[base + REG_PERIOD_LO] as u32 | ((regs[base + REG_PERIOD_HI] as u32) << 8)).max(1);
        channel.set_frequency((AMIGA_CLOCK / (2.0 * period as f64)) as f32);

        channel.set_waveform(match regs[base + REG_WAVEFORM] & 3 {
            0 => Waveform::Triangle,
            1 => Waveform::Sawtooth,
            3 => Waveform::Noise,
            _ => Waveform::Square,
        });

        let volume = (regs[base + REG_VOLUME].min(64)) as f32 / 64.0;
        channel.set_adsr(0, 0, 1.0, 0);
        channel.set_volume(volume);
        channel.set_gate(volume > 0.0);
        channel.set_enhanced(plus);
        channel.set_pan(if plus { PAN_LRRL[voice] } else { 0.0 });
    }

    // Hardware-PWM emulation: sweep each square voice's duty with its
    // LFO. Runs every sample in plus mode only.
    fn sweep_pwm(&self) {
        let regs = self.regs.lock().unwrap();
        let mut pwm = self.pwm.lock().unwrap();
        for voice in 0..VOICES {
            let base = voice * REG_STRIDE;
            let depth = regs[base + REG_PWM_DEPTH] as f64 / 255.0 * 0.4;
            let rate = regs[base + REG_PWM_RATE] as f64;
            if depth <= 0.0 || rate <= 0.0 {
                continue;
            }
            let state = &mut pwm[voice];
            state.phase += rate / 255.0 * 8.0 / crate::audio::SAMPLE_RATE as f64;
            state.phase -= state.phase.floor();
            let duty = 0.5 + depth * (2.0 * std::f64::consts::PI * state.phase).sin();
            self.engine.channels[CHANNEL_MAP[voice]].set_duty(duty as f32);
        }
    }

    fn silence(&self) {
        for voice in 0..VOICES {
            let channel = &self.engine.channels[CHANNEL_MAP[voice]];
            channel.set_gate(false);
            channel.set_volume(0.0);
            channel.set_pan(0.0);
        }
    }
}

impl SampleTicker for Ahx {
    fn name(&self) -> &'static str {
        "ahx"
    }

    fn tick(&self, sample_clock: u64) {
        self.queue.drain(sample_clock, |register, value| self.apply(register, value));
        if self.plus.load(Ordering::Relaxed) {
            self.sweep_pwm();
        }
    }

    fn reset(&self) {
        self.queue.clear();
        *self.regs.lock().unwrap() = [0; 0x48];
        for state in self.pwm.lock().unwrap().iter_mut() {
            state.phase = 0.0;
        }
        self.flags.store(0, Ordering::Relaxed);
        self.playing.store(false, Ordering::Relaxed);
        self.silence();
    }
}

impl Device for Ahx {
    fn memconfig(&self) -> MemoryRange {
        vec![(AHX_BASE, AHX_LIMIT)]
    }

    fn read32(&self, addr: u32) -> u32 {
        match addr - AHX_BASE {
            PLAYER_CTRL => self.plus.load(Ordering::Relaxed) as u32,
            PLAYER_STATUS => self.playing.load(Ordering::Relaxed) as u32,
            offset if (offset as usize) < 0x48 => {
                self.regs.lock().unwrap()[offset as usize] as u32
            }
            _ => 0,
        }
    }

    fn write32(&self, addr: u32, value: u32) {
        match addr - AHX_BASE {
            PLAYER_CTRL => {
                self.playing.store(value & 1 != 0, Ordering::Relaxed);
                self.plus.store(value & 2 != 0, Ordering::Relaxed);
                if value & 1 == 0 {
                    self.silence();
                }
            }
            offset if (offset as usize) < 0x48 => self.queue.push(ChipEvent {
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
    fn period_maps_to_paula_frequency() {
        let engine = AudioEngine::new();
        let ahx = Ahx::new(Arc::clone(&engine));
        // Period 404 is close to A-3 on Paula.
        ahx.apply(REG_PERIOD_LO as u8, (404 & 0xFF) as u8);
        ahx.apply(REG_PERIOD_HI as u8, (404 >> 8) as u8);
        ahx.apply(REG_VOLUME as u8, 64);
        let freq = engine.channels[5].frequency();
        assert!((freq - 4390.0).abs() < 30.0, "frequency was {freq}");
        assert!(engine.channels[5].gate());
    }

    #[test]
    fn plus_mode_spreads_lrrl() {
        let engine = AudioEngine::new();
        let ahx = Ahx::new(Arc::clone(&engine));
        ahx.set_plus(true);
        for voice in 0..4 {
            ahx.apply((voice * REG_STRIDE + REG_VOLUME) as u8, 64);
        }
        let pans: Vec<f32> = CHANNEL_MAP.iter().map(|&c| engine.channels[c].pan()).collect();
        assert!(pans[0] < 0.0 && pans[3] < 0.0, "outer voices pan left");
        assert!(pans[1] > 0.0 && pans[2] > 0.0, "inner voices pan right");
    }

    #[test]
    fn track0_flag_follows_reference_meaning() {
        let engine = AudioEngine::new();
        let ahx = Ahx::new(Arc::clone(&engine));
        assert!(ahx.track0_saved());
        ahx.apply(REG_FLAGS as u8, 0x80);
        assert!(!ahx.track0_saved());
    }
}
