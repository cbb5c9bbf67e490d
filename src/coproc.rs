// Coprocessor channels: MMIO-backed async RPC between the main CPU and
// background worker cores. Each channel owns a request ring and a reply
// ring; a worker pops a request, runs the named guest function on a
// fresh sub-CPU sharing RAM, and posts the reply id for the guest to
// poll. The argument/result mailbox convention is one doubleword of
// scratch RAM per channel: arg at +0, result at +4.

use crate::devices::{Device, MemoryRange};
use crate::memory::BusPtr;
use crate::mmio::*;
use crate::processor::{EmulatorCpu, StepResult};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Per-channel scratch mailbox in guest RAM: arg at +0, result at +4.
pub const MAILBOX_BASE: u32 = 0x0F00;
pub const MAILBOX_STRIDE: u32 = 8;

/// Upper bound on a single coprocessor call; a runaway function yields
/// a zero reply instead of wedging the worker.
const STEP_BUDGET: u64 = 50_000_000;

pub type CpuFactory = Arc<dyn Fn() -> Box<dyn EmulatorCpu> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Request {
    id: u32,
    fn_ptr: u32,
    arg: u32,
}

struct Channel {
    fn_ptr: AtomicU32,
    arg: AtomicU32,
    next_id: AtomicU32,
    last_id: AtomicU32,
    requests: Sender<Request>,
    work: Receiver<Request>,
    replies: Mutex<VecDeque<(u32, u32)>>,
    last_result: AtomicU32,
    active: AtomicBool,
}

impl Channel {
    fn new() -> Channel {
        let (requests, work) = bounded(64);
        Channel {
            fn_ptr: AtomicU32::new(0),
            arg: AtomicU32::new(0),
            next_id: AtomicU32::new(1),
            last_id: AtomicU32::new(0),
            requests,
            work,
            replies: Mutex::new(VecDeque::new()),
            last_result: AtomicU32::new(0),
            active: AtomicBool::new(false),
        }
    }

    fn enqueue(&self) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let request = Request {
            id,
            fn_ptr: self.fn_ptr.load(Ordering::Acquire),
            arg: self.arg.load(Ordering::Acquire),
        };
        if self.requests.try_send(request).is_err() {
            log::warn!("coproc: request ring full, dropping call");
            return 0;
        }
        self.last_id.store(id, Ordering::Release);
        id
    }

    fn poll(&self) -> u32 {
        let mut replies = self.replies.lock().unwrap();
        match replies.pop_front() {
            Some((id, result)) => {
                self.last_result.store(result, Ordering::Release);
                id
            }
            None => 0,
        }
    }
}

pub struct CoprocManager {
    channels: Vec<Channel>,
    bus: Mutex<Option<BusPtr>>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CoprocManager {
    pub fn new() -> Arc<CoprocManager> {
        Arc::new(CoprocManager {
            channels: (0..COPROC_CHANNELS as usize).map(|_| Channel::new()).collect(),
            bus: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn connect(&self, bus: &BusPtr) {
        *self.bus.lock().unwrap() = Some(Arc::clone(bus));
    }

    /// Spawn one worker per channel. `factory` builds a fresh sub-CPU
    /// context sharing RAM with the caller.
    pub fn start(self: &Arc<CoprocManager>, factory: CpuFactory) {
        self.running.store(true, Ordering::Release);
        let mut workers = self.workers.lock().unwrap();
        for index in 0..self.channels.len() {
            let manager = Arc::clone(self);
            let factory = Arc::clone(&factory);
            let running = Arc::clone(&self.running);
            let handle = std::thread::Builder::new()
                .name(format!("coproc-{index}"))
                .spawn(move || {
                    while running.load(Ordering::Acquire) {
                        let request = match manager.channels[index]
                            .work
                            .recv_timeout(Duration::from_millis(50))
                        {
                            Ok(request) => request,
                            Err(_) => continue,
                        };
                        let result = manager.execute(index, request, &factory);
                        manager.channels[index]
                            .replies
                            .lock()
                            .unwrap()
                            .push_back((request.id, result));
                    }
                })
                .expect("spawning a coproc worker cannot fail on a healthy host");
            workers.push(handle);
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn reset(&self) {
        for channel in &self.channels {
            while channel.work.try_recv().is_ok() {}
            channel.replies.lock().unwrap().clear();
            channel.next_id.store(1, Ordering::Release);
            channel.last_id.store(0, Ordering::Release);
            channel.last_result.store(0, Ordering::Release);
            channel.active.store(false, Ordering::Release);
        }
    }

    fn execute(&self, index: usize, request: Request, factory: &CpuFactory) -> u32 {
        let Some(bus) = self.bus.lock().unwrap().clone() else { return 0 };
        let mailbox = MAILBOX_BASE + index as u32 * MAILBOX_STRIDE;
        bus.write32(mailbox, request.arg);
        bus.write32(mailbox + 4, 0);

        let mut cpu = factory();
        cpu.load_program(&[], request.fn_ptr, request.fn_ptr);
        let mut steps: u64 = 0;
        loop {
            match cpu.step() {
                StepResult::Continue => {
                    steps += 1;
                    if steps >= STEP_BUDGET {
                        log::warn!("coproc: channel {index} call exceeded its step budget");
                        return 0;
                    }
                }
                StepResult::Halted(_) => break,
            }
        }
        bus.read32(mailbox + 4)
    }
}

impl Device for CoprocManager {
    fn memconfig(&self) -> MemoryRange {
        vec![(COPROC_BASE, COPROC_LIMIT)]
    }

    fn read32(&self, addr: u32) -> u32 {
        let offset = addr - COPROC_BASE;
        let index = (offset / COPROC_STRIDE) as usize;
        if index >= self.channels.len() {
            return 0;
        }
        let channel = &self.channels[index];
        match offset % COPROC_STRIDE {
            COP_FN => channel.fn_ptr.load(Ordering::Acquire),
            COP_ARG => channel.arg.load(Ordering::Acquire),
            COP_PUSH => channel.last_id.load(Ordering::Acquire),
            COP_POLL => channel.poll(),
            COP_RESULT => channel.last_result.load(Ordering::Acquire),
            COP_CTRL => channel.active.load(Ordering::Acquire) as u32,
            COP_STATUS => {
                let mut status = channel.active.load(Ordering::Acquire) as u32;
                if !channel.replies.lock().unwrap().is_empty() {
                    status |= 2;
                }
                status
            }
            _ => 0,
        }
    }

    fn write32(&self, addr: u32, value: u32) {
        let offset = addr - COPROC_BASE;
        let index = (offset / COPROC_STRIDE) as usize;
        if index >= self.channels.len() {
            return;
        }
        let channel = &self.channels[index];
        match offset % COPROC_STRIDE {
            COP_FN => channel.fn_ptr.store(value, Ordering::Release),
            COP_ARG => channel.arg.store(value, Ordering::Release),
            COP_PUSH => {
                if channel.active.load(Ordering::Acquire) {
                    channel.enqueue();
                } else {
                    log::warn!("coproc: push on stopped channel {index}");
                }
            }
            COP_CTRL => channel.active.store(value & 1 != 0, Ordering::Release),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::ie32::{asm, Ie32};
    use crate::memory::Bus;

    #[test]
    fn round_trip_call_through_worker() {
        let bus = Bus::new();
        let manager = CoprocManager::new();
        manager.connect(&bus);
        bus.attach(manager.clone() as Arc<dyn Device>);

        // Guest function at 0x5000: load the channel-0 mailbox arg,
        // double it, store the result, halt.
        let mailbox = MAILBOX_BASE;
        let program = asm::assemble(&[
            asm::i(0x03, 2, 0, mailbox),       // addi r2, r0, mailbox
            asm::i(0x22, 1, 2, 0),             // ld32 r1, [r2]
            asm::r(0x10, 1, 1, 1),             // add r1, r1, r1
            asm::s(0x2A, 2, 1, 4),             // st32 [r2+4], r1
            asm::HALT,
        ]);
        bus.load_image(0x5000, &program);

        let factory_bus = Arc::clone(&bus);
        manager.start(Arc::new(move || {
            Box::new(Ie32::new(Arc::clone(&factory_bus))) as Box<dyn EmulatorCpu>
        }));

        bus.write32(COPROC_BASE + COP_CTRL, 1);
        bus.write32(COPROC_BASE + COP_FN, 0x5000);
        bus.write32(COPROC_BASE + COP_ARG, 21);
        bus.write32(COPROC_BASE + COP_PUSH, 1);
        let id = bus.read32(COPROC_BASE + COP_PUSH);
        assert_eq!(id, 1);

        // Guest-style wait: busy-poll the reply ring.
        let mut polled = 0;
        for _ in 0..1_000 {
            polled = bus.read32(COPROC_BASE + COP_POLL);
            if polled != 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(polled, id);
        assert_eq!(bus.read32(COPROC_BASE + COP_RESULT), 42);
        manager.stop();
    }

    #[test]
    fn push_on_stopped_channel_is_ignored() {
        let bus = Bus::new();
        let manager = CoprocManager::new();
        manager.connect(&bus);
        bus.attach(manager.clone() as Arc<dyn Device>);
        bus.write32(COPROC_BASE + COP_PUSH, 1);
        assert_eq!(bus.read32(COPROC_BASE + COP_PUSH), 0);
    }
}
