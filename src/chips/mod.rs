// The chip engines: each one is an MMIO register bank on the bus and a
// SampleTicker on the audio engine. Register writes become timestamped
// events; the mixer drains them at sample granularity so a player that
// wrote ahead of the clock lands exactly where it aimed.

pub mod ahx;
pub mod pokey;
pub mod psg;
pub mod sid;
pub mod ted;

use crate::audio::ChipEvent;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Mutex;

/// Single-producer single-consumer event queue between a chip's MMIO
/// side and its ticker side. Events arrive in ascending sample_offset
/// order per producer; the one un-consumed lookahead event sits in
/// `pending` until the clock reaches it.
pub struct EventQueue {
    tx: Sender<ChipEvent>,
    rx: Receiver<ChipEvent>,
    pending: Mutex<Option<ChipEvent>>,
}

impl EventQueue {
    pub fn new() -> EventQueue {
        let (tx, rx) = unbounded();
        EventQueue { tx, rx, pending: Mutex::new(None) }
    }

    pub fn push(&self, event: ChipEvent) {
        let _ = self.tx.send(event);
    }

    /// Deliver every event due at or before `clock`, in order.
    pub fn drain(&self, clock: u64, mut apply: impl FnMut(u8, u8)) {
        let mut pending = self.pending.lock().unwrap();
        loop {
            let event = match pending.take() {
                Some(event) => event,
                None => match self.rx.try_recv() {
                    Ok(event) => event,
                    Err(_) => return,
                },
            };
            if event.sample_offset > clock {
                *pending = Some(event);
                return;
            }
            apply(event.register, event.value);
        }
    }

    pub fn clear(&self) {
        *self.pending.lock().unwrap() = None;
        while self.rx.try_recv().is_ok() {}
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_respects_sample_offsets() {
        let queue = EventQueue::new();
        queue.push(ChipEvent { sample_offset: 5, register: 1, value: 10 });
        queue.push(ChipEvent { sample_offset: 7, register: 2, value: 20 });

        let mut seen = Vec::new();
        queue.drain(4, |r, v| seen.push((r, v)));
        assert!(seen.is_empty());
        queue.drain(5, |r, v| seen.push((r, v)));
        assert_eq!(seen, vec![(1, 10)]);
        queue.drain(6, |r, v| seen.push((r, v)));
        assert_eq!(seen.len(), 1);
        queue.drain(7, |r, v| seen.push((r, v)));
        assert_eq!(seen, vec![(1, 10), (2, 20)]);
    }

    #[test]
    fn clear_drops_everything() {
        let queue = EventQueue::new();
        queue.push(ChipEvent { sample_offset: 0, register: 0, value: 1 });
        queue.push(ChipEvent { sample_offset: 9, register: 0, value: 2 });
        queue.drain(0, |_, _| {}); // leaves the offset-9 event pending
        queue.clear();
        let mut count = 0;
        queue.drain(u64::MAX, |_, _| count += 1);
        assert_eq!(count, 0);
    }
}
