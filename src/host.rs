// Host sinks: the minifb window for composed frames and the rodio
// output stream for the mixed audio, each behind a small trait with a
// headless twin so CI and -term runs never open a window or touch an
// audio device.

use crate::audio::{AudioSink, SAMPLE_RATE};
use crate::error::EngineError;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use minifb::{Key, KeyRepeat, Scale, Window, WindowOptions};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Host-side happenings the main loop reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Quit,
    ToggleMonitor,
    HardReset,
    ToggleStatusBar,
    Char(u8),
}

pub trait DisplaySink {
    /// Present a composed frame; false once the window has closed.
    fn present(&mut self, width: usize, height: usize, pixels: &[u32]) -> bool;
    fn poll_events(&mut self) -> Vec<HostEvent>;
}

struct CharBuffer(Arc<Mutex<Vec<u8>>>);

impl minifb::InputCallback for CharBuffer {
    fn add_char(&mut self, uni_char: u32) {
        if let Some(c) = char::from_u32(uni_char) {
            if c.is_ascii() {
                self.0.lock().unwrap().push(c as u8);
            }
        }
    }
}

pub struct MinifbDisplay {
    window: Option<Window>,
    width: usize,
    height: usize,
    scale: Scale,
    borderless: bool,
    title: String,
    chars: Arc<Mutex<Vec<u8>>>,
}

impl MinifbDisplay {
    pub fn new(title: &str, scale: u32, fullscreen: bool) -> MinifbDisplay {
        let scale = match scale {
            2 => Scale::X2,
            4 => Scale::X4,
            _ => Scale::X1,
        };
        if fullscreen {
            log::warn!("display: true fullscreen is not available; using a borderless window");
        }
        MinifbDisplay {
            window: None,
            width: 0,
            height: 0,
            scale,
            borderless: fullscreen,
            title: title.to_string(),
            chars: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn reopen(&mut self, width: usize, height: usize) -> Result<(), EngineError> {
        let mut window = Window::new(
            &self.title,
            width,
            height,
            WindowOptions {
                scale: self.scale,
                borderless: self.borderless,
                ..WindowOptions::default()
            },
        )
        .map_err(|e| EngineError::DeviceInit(format!("cannot open display window: {e}")))?;
        window.limit_update_rate(Some(Duration::from_micros(16_600)));
        window.set_input_callback(Box::new(CharBuffer(Arc::clone(&self.chars))));
        self.window = Some(window);
        self.width = width;
        self.height = height;
        Ok(())
    }
}

impl DisplaySink for MinifbDisplay {
    fn present(&mut self, width: usize, height: usize, pixels: &[u32]) -> bool {
        if self.window.is_none() || self.width != width || self.height != height {
            if let Err(e) = self.reopen(width, height) {
                log::error!("display: {e}");
                return false;
            }
        }
        let window = self.window.as_mut().expect("window was just opened");
        if !window.is_open() {
            return false;
        }
        if let Err(e) = window.update_with_buffer(pixels, width, height) {
            log::error!("display update failed: {e}");
            return false;
        }
        true
    }

    fn poll_events(&mut self) -> Vec<HostEvent> {
        let mut events = Vec::new();
        let Some(window) = self.window.as_mut() else { return events };
        if !window.is_open() || window.is_key_down(Key::Escape) {
            events.push(HostEvent::Quit);
            return events;
        }
        if window.is_key_pressed(Key::F9, KeyRepeat::No) {
            events.push(HostEvent::ToggleMonitor);
        }
        if window.is_key_pressed(Key::F10, KeyRepeat::No) {
            events.push(HostEvent::HardReset);
        }
        if window.is_key_pressed(Key::F12, KeyRepeat::No) {
            events.push(HostEvent::ToggleStatusBar);
        }
        if window.is_key_pressed(Key::Enter, KeyRepeat::Yes) {
            events.push(HostEvent::Char(b'\n'));
        }
        if window.is_key_pressed(Key::Backspace, KeyRepeat::Yes) {
            events.push(HostEvent::Char(0x08));
        }
        for byte in self.chars.lock().unwrap().drain(..) {
            events.push(HostEvent::Char(byte));
        }
        events
    }
}

/// No-window display for CI and terminal mode.
pub struct HeadlessDisplay;

impl DisplaySink for HeadlessDisplay {
    fn present(&mut self, _width: usize, _height: usize, _pixels: &[u32]) -> bool {
        true
    }
    fn poll_events(&mut self) -> Vec<HostEvent> {
        Vec::new()
    }
}

// ---------------------------------------------------------------------
// Audio
// ---------------------------------------------------------------------

// Bridges the mixer thread to rodio: the mixer pushes into a bounded
// channel (backpressure paces it), the rodio source pops on the audio
// callback side.
struct RingSource {
    rx: Receiver<f32>,
}

impl Iterator for RingSource {
    type Item = f32;
    fn next(&mut self) -> Option<f32> {
        // Underruns produce silence rather than ending the stream.
        Some(self.rx.try_recv().unwrap_or(0.0))
    }
}

impl rodio::Source for RingSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }
    fn channels(&self) -> u16 {
        2
    }
    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }
    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

pub struct RodioAudio {
    tx: Sender<f32>,
    // Held alive for the lifetime of the sink; dropping them kills the
    // stream.
    _stream: rodio::OutputStream,
}

// cpal's Stream type is conservatively marked !Send on every platform even
// though nothing here touches it after construction; it's only held to
// keep the device alive, and AudioSink instances are handed to the mixer
// thread once at startup.
unsafe impl Send for RodioAudio {}

impl RodioAudio {
    pub fn new() -> Result<RodioAudio, EngineError> {
        let (stream, handle) = rodio::OutputStream::try_default()
            .map_err(|e| EngineError::DeviceInit(format!("cannot open audio output: {e}")))?;
        let (tx, rx) = bounded::<f32>(SAMPLE_RATE as usize / 4);
        handle
            .play_raw(RingSource { rx })
            .map_err(|e| EngineError::DeviceInit(format!("cannot start audio stream: {e}")))?;
        Ok(RodioAudio { tx, _stream: stream })
    }
}

impl AudioSink for RodioAudio {
    fn write(&mut self, interleaved: &[f32]) {
        for &sample in interleaved {
            // Block while the device drains; bail out if it vanished.
            match self.tx.try_send(sample) {
                Ok(()) => {}
                Err(TrySendError::Full(sample)) => {
                    if self.tx.send_timeout(sample, Duration::from_millis(100)).is_err() {
                        return;
                    }
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

/// Consumes the stream at roughly real time so the mixer neither spins
/// nor stalls when no audio device exists.
pub struct HeadlessAudio;

impl AudioSink for HeadlessAudio {
    fn write(&mut self, interleaved: &[f32]) {
        let frames = interleaved.len() / 2;
        std::thread::sleep(Duration::from_micros(
            frames as u64 * 1_000_000 / SAMPLE_RATE as u64,
        ));
    }
}
