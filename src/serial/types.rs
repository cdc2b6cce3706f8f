use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;

static REQUEST_SEQUENCE: AtomicU32 = AtomicU32::new(1);

pub fn next_request_id() -> u32 {
    REQUEST_SEQUENCE.fetch_add(1, Ordering::SeqCst)
}

/// A single AT command heading for the wire. `data` must already carry its
/// `\r\n` terminator; the daemon writes it verbatim.
#[derive(Debug, Clone)]
pub struct SerialRequest {
    pub id: u32,
    pub data: Vec<u8>,
    pub timeout: Duration,
}
impl SerialRequest {
    pub fn new(data: Vec<u8>, timeout: Duration) -> Self {
        Self {
            id: next_request_id(),
            data,
            timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SerialResponse {
    pub id: u32,
    pub data: Vec<u8>,
}

/// Transport failures as seen by callers. Cloneable so a single result can be
/// fanned out to every caller coalesced onto one in-flight command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("failed to open serial port: {0}")]
    Open(String),

    #[error("serial i/o error: {0}")]
    Io(String),

    #[error("response deadline exceeded")]
    Timeout,

    #[error("modem unresponsive, {0} consecutive empty reads")]
    Unresponsive(u32),

    #[error("no serial daemon available")]
    NoDaemon,

    #[error("request queue full")]
    QueueFull,

    #[error("serial daemon closed while request was pending")]
    Closed,
}
impl PortError {
    /// Errors that force the daemon down. Command-level timeouts leave the
    /// daemon serving; broken I/O does not.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PortError::Open(_) | PortError::Io(_))
    }
}
