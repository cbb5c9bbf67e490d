// Single-instance IPC over a per-user Unix domain socket. A second
// invocation connects, sends `OPEN <abs_path>` and exits; the primary's
// acceptor thread forwards each path to the lifecycle controller.
// Authentication is the filesystem permission on the endpoint, which is
// why the path is namespaced by user id. Non-Unix hosts simply run
// without single-instance behaviour.

use crate::error::EngineError;
use std::path::PathBuf;

pub enum Instance {
    /// We own the endpoint; the acceptor thread is running.
    Primary,
    /// An existing process took the open request; exit cleanly.
    Forwarded,
}

/// Endpoint path derived from the process's user identity.
pub fn endpoint_path() -> PathBuf {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".into());
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(dir) => PathBuf::from(dir).join("intuition-engine.sock"),
        Err(_) => std::env::temp_dir().join(format!("intuition-engine-{user}.sock")),
    }
}

#[cfg(unix)]
pub fn claim_or_forward(
    open: Option<&std::path::Path>,
    forward: crossbeam_channel::Sender<PathBuf>,
) -> Result<Instance, EngineError> {
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::{UnixListener, UnixStream};

    let endpoint = endpoint_path();

    // Try the existing primary first.
    if let Ok(mut stream) = UnixStream::connect(&endpoint) {
        if let Some(path) = open {
            let absolute = std::fs::canonicalize(path)?;
            writeln!(stream, "OPEN {}", absolute.display())?;
            log::info!("ipc: forwarded {} to the running instance", absolute.display());
        }
        return Ok(Instance::Forwarded);
    }

    // Nobody home; a stale socket file from a crashed run may remain.
    let _ = std::fs::remove_file(&endpoint);
    let listener = UnixListener::bind(&endpoint)
        .map_err(|e| EngineError::DeviceInit(format!("cannot bind {endpoint:?}: {e}")))?;

    std::thread::Builder::new()
        .name("ipc-acceptor".into())
        .spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let reader = BufReader::new(stream);
                for line in reader.lines() {
                    let Ok(line) = line else { break };
                    if let Some(path) = line.strip_prefix("OPEN ") {
                        log::info!("ipc: open request for {path}");
                        if forward.send(PathBuf::from(path)).is_err() {
                            return;
                        }
                    } else {
                        log::warn!("ipc: ignoring malformed message {line:?}");
                    }
                }
            }
        })
        .map_err(|e| EngineError::DeviceInit(format!("ipc acceptor thread: {e}")))?;

    Ok(Instance::Primary)
}

#[cfg(not(unix))]
pub fn claim_or_forward(
    _open: Option<&std::path::Path>,
    _forward: crossbeam_channel::Sender<PathBuf>,
) -> Result<Instance, EngineError> {
    Ok(Instance::Primary)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn endpoint_is_user_namespaced() {
        let path = endpoint_path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("intuition-engine"));
    }
}
