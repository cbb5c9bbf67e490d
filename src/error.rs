use std::path::PathBuf;
use thiserror::Error;

/// Everything that can go wrong on the host side of the platform.
///
/// Guest action never produces one of these: bus accesses degrade to zero
/// reads and no-op writes, audio degrades to silence, video to a black
/// frame. Errors exist for host concerns only.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("program image {path:?} unreadable: {source}")]
    ProgramImage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bus fault at {addr:#010x} ({width}-bit access)")]
    BusFault { addr: u32, width: u8 },

    #[error("CPU halted: {0}")]
    CpuHalt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("playback error: {0}")]
    Playback(String),

    #[error("device initialisation failed: {0}")]
    DeviceInit(String),
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Config(msg.into())
    }

    /// Exit code the binary reports for this error.
    pub fn exit_code(&self) -> i32 {
        1
    }
}
