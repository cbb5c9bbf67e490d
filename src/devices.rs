// Bus-facing device plumbing plus the simple MMIO peripherals: the
// terminal byte port, the sandboxed file-I/O block, the media loader and
// the program executor. Registers are 32-bit cells; byte-wide registers
// carry their value in the low lanes.

use crate::memory::{Bus, BusPtr};
use crate::mmio::*;
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

pub type MemoryRange = Vec<(u32, u32)>;

/// A memory-mapped peripheral. `memconfig` names the address ranges the
/// device answers on; the bus routes matching accesses to `read32` and
/// `write32` on the accessing thread, so implementations lock internally.
pub trait Device: Send + Sync {
    fn memconfig(&self) -> MemoryRange;
    fn read32(&self, addr: u32) -> u32;
    fn write32(&self, addr: u32, value: u32);
}

/// A device registered with native 64-bit handlers as well.
pub trait Device64: Device {
    fn read64(&self, addr: u32) -> u64;
    fn write64(&self, addr: u32, value: u64);
}

// Devices that chase guest pointers (file names, buffers) hold a weak bus
// reference wired up after construction; a dead or unset bus degrades to
// zero reads.
pub struct BusHandle {
    bus: OnceLock<Weak<Bus>>,
}

impl BusHandle {
    pub fn new() -> Self {
        BusHandle { bus: OnceLock::new() }
    }
    pub fn connect(&self, bus: &BusPtr) {
        let _ = self.bus.set(Arc::downgrade(bus));
    }
    pub fn get(&self) -> Option<BusPtr> {
        self.bus.get().and_then(Weak::upgrade)
    }
}

impl Default for BusHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Read a NUL-terminated guest string, capped at 4 KiB.
pub fn read_guest_string(bus: &Bus, mut addr: u32) -> String {
    let mut out = Vec::new();
    while out.len() < 4096 {
        let b = bus.read8(addr);
        if b == 0 {
            break;
        }
        out.push(b);
        addr = addr.wrapping_add(1);
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ---------------------------------------------------------------------
// Terminal
// ---------------------------------------------------------------------

/// Where terminal output lands: the host's stdio, or the in-window video
/// terminal (characters written straight into VGA text RAM).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalMode {
    HostStdio,
    VideoText,
}

struct VideoCursor {
    col: usize,
    row: usize,
}

struct TerminalState {
    input: VecDeque<u8>,
    mode: TerminalMode,
    cursor: VideoCursor,
}

pub struct Terminal {
    state: Mutex<TerminalState>,
    bus: BusHandle,
}

const TEXT_COLS: usize = 80;
const TEXT_ROWS: usize = 25;
const TEXT_ATTR: u8 = 0x07;

impl Terminal {
    pub fn new() -> Arc<Terminal> {
        Arc::new(Terminal {
            state: Mutex::new(TerminalState {
                input: VecDeque::new(),
                mode: TerminalMode::HostStdio,
                cursor: VideoCursor { col: 0, row: 0 },
            }),
            bus: BusHandle::new(),
        })
    }

    pub fn connect(&self, bus: &BusPtr) {
        self.bus.connect(bus);
    }

    /// Host-side key delivery (window keyboard or stdin pump).
    pub fn push_input(&self, byte: u8) {
        self.state.lock().unwrap().input.push_back(byte);
    }

    pub fn set_mode(&self, mode: TerminalMode) {
        let mut state = self.state.lock().unwrap();
        state.mode = mode;
        state.cursor = VideoCursor { col: 0, row: 0 };
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.input.clear();
        state.cursor = VideoCursor { col: 0, row: 0 };
    }

    fn putc(&self, byte: u8) {
        let mut state = self.state.lock().unwrap();
        match state.mode {
            TerminalMode::HostStdio => {
                let mut out = std::io::stdout();
                let _ = out.write_all(&[byte]);
                let _ = out.flush();
            }
            TerminalMode::VideoText => {
                let Some(bus) = self.bus.get() else { return };
                match byte {
                    b'\n' => {
                        state.cursor.col = 0;
                        state.cursor.row += 1;
                    }
                    b'\r' => state.cursor.col = 0,
                    0x08 => {
                        if state.cursor.col > 0 {
                            state.cursor.col -= 1;
                            let cell = VGA_TEXT_RAM
                                + 2 * (state.cursor.row * TEXT_COLS + state.cursor.col) as u32;
                            bus.write16(cell, u16::from_le_bytes([b' ', TEXT_ATTR]));
                        }
                    }
                    _ => {
                        let cell = VGA_TEXT_RAM
                            + 2 * (state.cursor.row * TEXT_COLS + state.cursor.col) as u32;
                        bus.write16(cell, u16::from_le_bytes([byte, TEXT_ATTR]));
                        state.cursor.col += 1;
                        if state.cursor.col >= TEXT_COLS {
                            state.cursor.col = 0;
                            state.cursor.row += 1;
                        }
                    }
                }
                if state.cursor.row >= TEXT_ROWS {
                    // Scroll the text page one row up through the bus.
                    for row in 1..TEXT_ROWS {
                        for col in 0..TEXT_COLS {
                            let src = VGA_TEXT_RAM + 2 * (row * TEXT_COLS + col) as u32;
                            let dst = VGA_TEXT_RAM + 2 * ((row - 1) * TEXT_COLS + col) as u32;
                            let cell = bus.read16(src);
                            bus.write16(dst, cell);
                        }
                    }
                    for col in 0..TEXT_COLS {
                        let cell = VGA_TEXT_RAM + 2 * ((TEXT_ROWS - 1) * TEXT_COLS + col) as u32;
                        bus.write16(cell, u16::from_le_bytes([b' ', TEXT_ATTR]));
                    }
                    state.cursor.row = TEXT_ROWS - 1;
                }
            }
        }
    }
}

impl Device for Terminal {
    fn memconfig(&self) -> MemoryRange {
        vec![(TERM_BASE, TERM_LIMIT)]
    }
    fn read32(&self, addr: u32) -> u32 {
        match addr {
            TERM_DATA => {
                let mut state = self.state.lock().unwrap();
                state.input.pop_front().map_or(0, u32::from)
            }
            TERM_STATUS => {
                let state = self.state.lock().unwrap();
                let mut status = 0x2; // output always ready
                if !state.input.is_empty() {
                    status |= 0x1;
                }
                status
            }
            _ => 0,
        }
    }
    fn write32(&self, addr: u32, value: u32) {
        match addr {
            TERM_DATA => self.putc(value as u8),
            TERM_CTRL => {
                if value & 1 != 0 {
                    self.state.lock().unwrap().input.clear();
                }
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------
// File I/O
// ---------------------------------------------------------------------

const FIO_OPEN: u32 = 1;
const FIO_READ: u32 = 2;
const FIO_WRITE: u32 = 3;
const FIO_CLOSE: u32 = 4;
const FIO_SEEK: u32 = 5;

const FIO_OK: u32 = 0;
const FIO_ERR_NOT_FOUND: u32 = 1;
const FIO_ERR_DENIED: u32 = 2;
const FIO_ERR_BAD_HANDLE: u32 = 3;
const FIO_ERR_IO: u32 = 4;

struct FileIoState {
    handles: HashMap<u32, File>,
    next_handle: u32,
    name_ptr: u32,
    buf_ptr: u32,
    len: u32,
    seek: u32,
    handle: u32,
    status: u32,
    result: u32,
}

/// Guest access to a sandboxed slice of the host filesystem. Paths are
/// resolved beneath `root`; anything trying to climb out is denied.
pub struct FileIo {
    state: Mutex<FileIoState>,
    root: PathBuf,
    bus: BusHandle,
}

impl FileIo {
    pub fn new(root: PathBuf) -> Arc<FileIo> {
        Arc::new(FileIo {
            state: Mutex::new(FileIoState {
                handles: HashMap::new(),
                next_handle: 1,
                name_ptr: 0,
                buf_ptr: 0,
                len: 0,
                seek: 0,
                handle: 0,
                status: FIO_OK,
                result: 0,
            }),
            root,
            bus: BusHandle::new(),
        })
    }

    pub fn connect(&self, bus: &BusPtr) {
        self.bus.connect(bus);
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.handles.clear();
        state.next_handle = 1;
        state.status = FIO_OK;
        state.result = 0;
    }

    fn sandboxed(&self, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name);
        let mut clean = PathBuf::new();
        for part in relative.components() {
            match part {
                Component::Normal(p) => clean.push(p),
                Component::CurDir => {}
                // Anything that can escape the root is refused outright.
                _ => return None,
            }
        }
        Some(self.root.join(clean))
    }

    fn execute(&self, cmd: u32) {
        let Some(bus) = self.bus.get() else { return };
        let mut state = self.state.lock().unwrap();
        state.result = 0;
        state.status = match cmd {
            FIO_OPEN => self.do_open(&bus, &mut state),
            FIO_READ => self.do_read(&bus, &mut state),
            FIO_WRITE => self.do_write(&bus, &mut state),
            FIO_CLOSE => {
                let handle = state.handle;
                if state.handles.remove(&handle).is_some() {
                    FIO_OK
                } else {
                    FIO_ERR_BAD_HANDLE
                }
            }
            FIO_SEEK => {
                let handle = state.handle;
                let offset = state.seek as u64;
                match state.handles.get_mut(&handle) {
                    Some(file) => match file.seek(SeekFrom::Start(offset)) {
                        Ok(pos) => {
                            state.result = pos as u32;
                            FIO_OK
                        }
                        Err(_) => FIO_ERR_IO,
                    },
                    None => FIO_ERR_BAD_HANDLE,
                }
            }
            _ => FIO_ERR_IO,
        };
    }

    fn do_open(&self, bus: &Bus, state: &mut FileIoState) -> u32 {
        let name = read_guest_string(bus, state.name_ptr);
        let Some(path) = self.sandboxed(&name) else {
            log::warn!("guest open denied: {name:?}");
            return FIO_ERR_DENIED;
        };
        let writable = state.len != 0;
        let opened = if writable {
            OpenOptions::new().read(true).write(true).create(true).open(&path)
        } else {
            File::open(&path)
        };
        match opened {
            Ok(file) => {
                let handle = state.next_handle;
                state.next_handle += 1;
                state.handles.insert(handle, file);
                state.result = handle;
                FIO_OK
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FIO_ERR_NOT_FOUND,
            Err(_) => FIO_ERR_IO,
        }
    }

    fn do_read(&self, bus: &Bus, state: &mut FileIoState) -> u32 {
        let handle = state.handle;
        let len = state.len.min(1 << 20) as usize;
        let buf_ptr = state.buf_ptr;
        let Some(file) = state.handles.get_mut(&handle) else {
            return FIO_ERR_BAD_HANDLE;
        };
        let mut buf = vec![0u8; len];
        match file.read(&mut buf) {
            Ok(n) => {
                for (i, b) in buf[..n].iter().enumerate() {
                    bus.write8(buf_ptr.wrapping_add(i as u32), *b);
                }
                state.result = n as u32;
                FIO_OK
            }
            Err(_) => FIO_ERR_IO,
        }
    }

    fn do_write(&self, bus: &Bus, state: &mut FileIoState) -> u32 {
        let handle = state.handle;
        let len = state.len.min(1 << 20) as usize;
        let buf_ptr = state.buf_ptr;
        let Some(file) = state.handles.get_mut(&handle) else {
            return FIO_ERR_BAD_HANDLE;
        };
        let mut buf = vec![0u8; len];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = bus.read8(buf_ptr.wrapping_add(i as u32));
        }
        match file.write_all(&buf) {
            Ok(()) => {
                state.result = len as u32;
                FIO_OK
            }
            Err(_) => FIO_ERR_IO,
        }
    }
}

impl Device for FileIo {
    fn memconfig(&self) -> MemoryRange {
        vec![(FILE_BASE, FILE_LIMIT)]
    }
    fn read32(&self, addr: u32) -> u32 {
        let state = self.state.lock().unwrap();
        match addr {
            FILE_STATUS => state.status,
            FILE_RESULT => state.result,
            FILE_HANDLE => state.handle,
            _ => 0,
        }
    }
    fn write32(&self, addr: u32, value: u32) {
        match addr {
            FILE_CMD => self.execute(value),
            FILE_HANDLE => self.state.lock().unwrap().handle = value,
            FILE_NAME_PTR => self.state.lock().unwrap().name_ptr = value,
            FILE_BUF_PTR => self.state.lock().unwrap().buf_ptr = value,
            FILE_LEN => self.state.lock().unwrap().len = value,
            FILE_SEEK => self.state.lock().unwrap().seek = value,
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------
// Media loader
// ---------------------------------------------------------------------

/// Pulls a host file (under the same sandbox root as FileIo) straight
/// into guest RAM; used by loaders that stream media without the byte
/// churn of the file-I/O block.
pub struct MediaLoader {
    state: Mutex<MediaState>,
    root: PathBuf,
    bus: BusHandle,
}

struct MediaState {
    name_ptr: u32,
    dest: u32,
    status: u32,
    len: u32,
}

impl MediaLoader {
    pub fn new(root: PathBuf) -> Arc<MediaLoader> {
        Arc::new(MediaLoader {
            state: Mutex::new(MediaState { name_ptr: 0, dest: 0, status: 0, len: 0 }),
            root,
            bus: BusHandle::new(),
        })
    }

    pub fn connect(&self, bus: &BusPtr) {
        self.bus.connect(bus);
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.status = 0;
        state.len = 0;
    }

    fn load(&self) {
        let Some(bus) = self.bus.get() else { return };
        let mut state = self.state.lock().unwrap();
        let name = read_guest_string(&bus, state.name_ptr);
        let mut clean = PathBuf::new();
        for part in Path::new(&name).components() {
            match part {
                Component::Normal(p) => clean.push(p),
                Component::CurDir => {}
                _ => {
                    state.status = FIO_ERR_DENIED;
                    return;
                }
            }
        }
        match std::fs::read(self.root.join(clean)) {
            Ok(bytes) => {
                bus.load_image(state.dest, &bytes);
                state.len = bytes.len() as u32;
                state.status = FIO_OK;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => state.status = FIO_ERR_NOT_FOUND,
            Err(_) => state.status = FIO_ERR_IO,
        }
    }
}

impl Device for MediaLoader {
    fn memconfig(&self) -> MemoryRange {
        vec![(MEDIA_BASE, MEDIA_LIMIT)]
    }
    fn read32(&self, addr: u32) -> u32 {
        let state = self.state.lock().unwrap();
        match addr {
            MEDIA_STATUS => state.status,
            MEDIA_LEN => state.len,
            _ => 0,
        }
    }
    fn write32(&self, addr: u32, value: u32) {
        match addr {
            MEDIA_CMD => {
                if value == 1 {
                    self.load();
                }
            }
            MEDIA_NAME_PTR => self.state.lock().unwrap().name_ptr = value,
            MEDIA_DEST => self.state.lock().unwrap().dest = value,
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------
// Program executor
// ---------------------------------------------------------------------

/// Lets the guest reboot the machine into another program image. The
/// request is forwarded to the lifecycle controller; nothing happens on
/// the device thread beyond queueing.
pub struct ProgramExecutor {
    requests: crossbeam_channel::Sender<PathBuf>,
    name_ptr: AtomicU32,
    status: AtomicU32,
    bus: BusHandle,
}

impl ProgramExecutor {
    pub fn new(requests: crossbeam_channel::Sender<PathBuf>) -> Arc<ProgramExecutor> {
        Arc::new(ProgramExecutor {
            requests,
            name_ptr: AtomicU32::new(0),
            status: AtomicU32::new(0),
            bus: BusHandle::new(),
        })
    }

    pub fn connect(&self, bus: &BusPtr) {
        self.bus.connect(bus);
    }
}

impl Device for ProgramExecutor {
    fn memconfig(&self) -> MemoryRange {
        vec![(EXEC_BASE, EXEC_LIMIT)]
    }
    fn read32(&self, addr: u32) -> u32 {
        match addr {
            EXEC_STATUS => self.status.load(Ordering::Acquire),
            _ => 0,
        }
    }
    fn write32(&self, addr: u32, value: u32) {
        match addr {
            EXEC_NAME_PTR => self.name_ptr.store(value, Ordering::Release),
            EXEC_CMD if value == 1 => {
                let Some(bus) = self.bus.get() else { return };
                let name = read_guest_string(&bus, self.name_ptr.load(Ordering::Acquire));
                let ok = self.requests.send(PathBuf::from(name)).is_ok();
                self.status.store(if ok { 0 } else { FIO_ERR_IO }, Ordering::Release);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_input_queue() {
        let bus = Bus::new();
        let term = Terminal::new();
        term.connect(&bus);
        bus.attach(term.clone() as Arc<dyn Device>);
        assert_eq!(bus.read32(TERM_STATUS) & 1, 0);
        term.push_input(b'A');
        assert_eq!(bus.read32(TERM_STATUS) & 1, 1);
        assert_eq!(bus.read32(TERM_DATA), b'A' as u32);
        assert_eq!(bus.read32(TERM_DATA), 0);
    }

    #[test]
    fn video_terminal_writes_text_ram() {
        let bus = Bus::new();
        let term = Terminal::new();
        term.connect(&bus);
        bus.attach(term.clone() as Arc<dyn Device>);
        term.set_mode(TerminalMode::VideoText);
        bus.write32(TERM_DATA, b'H' as u32);
        bus.write32(TERM_DATA, b'i' as u32);
        assert_eq!(bus.read8(VGA_TEXT_RAM), b'H');
        assert_eq!(bus.read8(VGA_TEXT_RAM + 2), b'i');
    }

    #[test]
    fn file_io_rejects_escape() {
        let io = FileIo::new(PathBuf::from("/tmp"));
        assert!(io.sandboxed("../etc/passwd").is_none());
        assert!(io.sandboxed("/etc/passwd").is_none());
        assert!(io.sandboxed("sub/dir/file.bin").is_some());
    }
}
