use crate::serial::types::{PortError, SerialRequest, SerialResponse};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::log::{debug, error, info, warn};

/// Per-read deadline inside the assembly loop.
const READ_DEADLINE: Duration = Duration::from_millis(100);

/// Consecutive empty reads before the modem is declared unresponsive.
const IDLE_READ_CEILING: u32 = 20;
const PROMPT_IDLE_READ_CEILING: u32 = 30;

/// Data-silence window after which a buffer that already carries a terminator
/// is accepted as-is. Covers modems that drop the trailing CRLF.
const SILENCE_WINDOW: Duration = Duration::from_millis(500);
const PROMPT_SILENCE_WINDOW: Duration = Duration::from_secs(1);

const LONG_COMMAND_BYTES: usize = 50;

const INIT_DRAIN_WINDOW: Duration = Duration::from_secs(2);
const INIT_SYNC_WINDOW: Duration = Duration::from_millis(500);

/// Status tokens that end a response. The surrounding CRLF is required so an
/// `OK` inside quoted payload text cannot end the assembly early.
const TERMINATORS: [&[u8]; 5] = [
    b"\r\nOK\r\n",
    b"\r\nERROR\r\n",
    b"+CME ERROR",
    b"\r\nCONNECT\r\n",
    b"\r\nNO CARRIER\r\n",
];

/// Same tokens without the trailing CRLF, consulted only by the data-silence
/// fallback.
const LENIENT_TERMINATORS: [&[u8]; 5] = [
    b"\r\nOK",
    b"\r\nERROR",
    b"+CME ERROR",
    b"\r\nCONNECT",
    b"\r\nNO CARRIER",
];

fn contains_token(haystack: &[u8], token: &[u8]) -> bool {
    haystack.windows(token.len()).any(|window| window == token)
}

fn has_terminator(buffer: &[u8]) -> bool {
    TERMINATORS.iter().any(|t| contains_token(buffer, t))
}

fn has_terminator_lenient(buffer: &[u8]) -> bool {
    LENIENT_TERMINATORS.iter().any(|t| contains_token(buffer, t))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    Normal,
    /// Over 50 bytes on the wire; doubled effective timeout.
    Long,
    /// Inbox listing and SMS service configuration; doubled effective timeout.
    SmsHeavy,
    /// Interactive send, terminated by the `>` prompt instead of a status line.
    SendPrompt,
}

/// Wall-clock budget for one command: slow families get twice the caller's
/// timeout. Both the dispatcher's assembly ceiling and the caller's reply
/// wait use this value, so the grace period actually reaches the caller.
pub fn effective_timeout(class: CommandClass, timeout: Duration) -> Duration {
    match class {
        CommandClass::Long | CommandClass::SmsHeavy => timeout * 2,
        _ => timeout,
    }
}

pub fn classify(data: &[u8]) -> CommandClass {
    if contains_token(data, b"+CMGS=") {
        return CommandClass::SendPrompt;
    }
    if [b"+CMGL".as_slice(), b"+CSMS", b"+CNMI"]
        .iter()
        .any(|needle| contains_token(data, needle))
    {
        return CommandClass::SmsHeavy;
    }
    if data.len() > LONG_COMMAND_BYTES {
        return CommandClass::Long;
    }
    CommandClass::Normal
}

struct QueuedRequest {
    request: SerialRequest,
    reply_tx: oneshot::Sender<Result<SerialResponse, PortError>>,
}

pub type ActiveRequests = Arc<Mutex<HashMap<u32, Instant>>>;

/// Owns the serial stream and serializes command execution onto it. One AT
/// command is on the wire at a time; callers queue behind a bounded channel.
pub struct PortDaemon {
    req_tx: mpsc::Sender<QueuedRequest>,
    active: ActiveRequests,
    quit_tx: watch::Sender<bool>,
}
impl PortDaemon {
    /// Run the init handshake on the stream, then spawn the dispatch loop.
    /// The returned handle completes when the daemon dies; the supervisor
    /// awaits it to drive restarts.
    pub async fn start<S>(
        mut stream: S,
        channel_capacity: usize,
        read_buffer_size: usize,
    ) -> Result<(Self, JoinHandle<()>), PortError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        initialize(&mut stream).await?;

        let (req_tx, req_rx) = mpsc::channel(channel_capacity);
        let (quit_tx, quit_rx) = watch::channel(false);
        let active: ActiveRequests = Arc::new(Mutex::new(HashMap::new()));

        let dispatcher = Dispatcher {
            stream,
            read_buffer: vec![0u8; read_buffer_size],
            active: Arc::clone(&active),
            cmd_lock: Mutex::new(()),
        };
        let handle = tokio::spawn(dispatcher.run(req_rx, quit_rx));

        Ok((
            Self {
                req_tx,
                active,
                quit_tx,
            },
            handle,
        ))
    }

    /// Enqueue a request and wait for its reply. The enqueue wait is bounded
    /// by the caller's timeout; the reply wait by the classification-based
    /// effective timeout, so slow command families keep their doubled budget
    /// all the way to the caller. An expired deadline fails the caller but
    /// never cancels the dispatcher's in-progress read; framing for the next
    /// command survives.
    pub async fn query(&self, request: SerialRequest) -> Result<SerialResponse, PortError> {
        let deadline = request.timeout;
        let reply_deadline = effective_timeout(classify(&request.data), request.timeout);
        let (reply_tx, reply_rx) = oneshot::channel();
        let queued = QueuedRequest { request, reply_tx };

        match timeout(deadline, self.req_tx.send(queued)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(PortError::Closed),
            Err(_) => return Err(PortError::QueueFull),
        }

        match timeout(reply_deadline, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PortError::Closed),
            Err(_) => Err(PortError::Timeout),
        }
    }

    /// Table of requests currently on the wire, keyed by id. Read by the
    /// supervisor's watchdog.
    pub fn active_requests(&self) -> ActiveRequests {
        Arc::clone(&self.active)
    }

    pub fn stop(&self) {
        let _ = self.quit_tx.send(true);
    }
}

struct Dispatcher<S> {
    stream: S,
    read_buffer: Vec<u8>,
    active: ActiveRequests,
    /// Held across one full write-and-assemble cycle.
    cmd_lock: Mutex<()>,
}
impl<S: AsyncRead + AsyncWrite + Unpin> Dispatcher<S> {
    async fn run(mut self, mut req_rx: mpsc::Receiver<QueuedRequest>, mut quit_rx: watch::Receiver<bool>) {
        debug!("port daemon dispatch loop started");
        loop {
            tokio::select! {
                maybe_queued = req_rx.recv() => {
                    let Some(queued) = maybe_queued else { break };
                    let id = queued.request.id;

                    self.active.lock().await.insert(id, Instant::now());
                    let result = self.execute(&queued.request).await;
                    self.active.lock().await.remove(&id);

                    let fatal = result.as_ref().err().is_some_and(PortError::is_fatal);
                    if let Err(e) = &result {
                        warn!("request #{id} failed: {e}");
                    }

                    // The caller may have timed out and dropped its receiver.
                    let _ = queued.reply_tx.send(result.map(|data| SerialResponse { id, data }));

                    if fatal {
                        error!("port daemon closing after fatal i/o error");
                        break;
                    }
                }
                _ = quit_rx.changed() => {
                    debug!("port daemon received stop signal");
                    break;
                }
            }
        }

        // Drain: every caller still queued learns the connection is gone.
        req_rx.close();
        while let Ok(queued) = req_rx.try_recv() {
            let _ = queued.reply_tx.send(Err(PortError::Closed));
        }
        info!("port daemon exited");
    }

    async fn execute(&mut self, request: &SerialRequest) -> Result<Vec<u8>, PortError> {
        let _serialized = self.cmd_lock.lock().await;

        let class = classify(&request.data);
        let budget = effective_timeout(class, request.timeout);
        debug!(
            "request #{} class {class:?}, effective timeout {budget:?}",
            request.id
        );

        write_full(&mut self.stream, &request.data).await?;
        assemble_response(&mut self.stream, &mut self.read_buffer, class, budget).await
    }
}

async fn write_full<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8]) -> Result<(), PortError> {
    stream
        .write_all(data)
        .await
        .map_err(|e| PortError::Io(e.to_string()))?;
    stream.flush().await.map_err(|e| PortError::Io(e.to_string()))
}

/// Accumulate reads until a terminator is observed or a timeout policy fires.
async fn assemble_response<S: AsyncRead + Unpin>(
    stream: &mut S,
    read_buffer: &mut [u8],
    class: CommandClass,
    effective_timeout: Duration,
) -> Result<Vec<u8>, PortError> {
    let prompt = class == CommandClass::SendPrompt;
    let (idle_ceiling, silence_window) = if prompt {
        (PROMPT_IDLE_READ_CEILING, PROMPT_SILENCE_WINDOW)
    } else {
        (IDLE_READ_CEILING, SILENCE_WINDOW)
    };

    let started = Instant::now();
    let mut last_data = Instant::now();
    let mut idle_reads: u32 = 0;
    let mut response: Vec<u8> = Vec::new();

    loop {
        match timeout(READ_DEADLINE, stream.read(read_buffer)).await {
            Ok(Ok(0)) => return Err(PortError::Io("serial stream closed".to_string())),
            Ok(Ok(n)) => {
                idle_reads = 0;
                last_data = Instant::now();
                response.extend_from_slice(&read_buffer[..n]);

                if has_terminator(&response) || (prompt && response.contains(&b'>')) {
                    return Ok(response);
                }
            }
            Ok(Err(e)) => return Err(PortError::Io(e.to_string())),
            Err(_) => {
                idle_reads += 1;
                if idle_reads >= idle_ceiling {
                    warn!("no serial data after {idle_reads} consecutive reads");
                    return Err(PortError::Unresponsive(idle_reads));
                }
                if started.elapsed() > effective_timeout {
                    return Err(PortError::Timeout);
                }
                if last_data.elapsed() >= silence_window
                    && !response.is_empty()
                    && has_terminator_lenient(&response)
                {
                    debug!("accepting response on data silence without trailing CRLF");
                    return Ok(response);
                }
            }
        }
    }
}

/// One-time handshake before the daemon serves requests: disable echo, route
/// URCs away from the command port, then resynchronize with a bare `AT`.
/// Failures here count as open failures so the supervisor backs off.
async fn initialize<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<(), PortError> {
    info!("running modem init handshake");

    let handshake: [(&[u8], Duration); 3] = [
        (b"ATE0\r\n", INIT_DRAIN_WINDOW),
        (b"AT+QURCCFG=\"urcport\",\"uart1\"\r\n", INIT_DRAIN_WINDOW),
        (b"AT\r\n", INIT_SYNC_WINDOW),
    ];

    for (command, window) in handshake {
        debug!("init command: {:?}", String::from_utf8_lossy(command));
        write_full(stream, command)
            .await
            .map_err(|e| PortError::Open(format!("init handshake: {e}")))?;

        let consumed = drain_response(stream, window).await?;
        debug!(
            "init response: {:?}",
            String::from_utf8_lossy(&consumed).trim()
        );
    }

    Ok(())
}

/// Best-effort read until a status token shows up or the window elapses.
async fn drain_response<S: AsyncRead + Unpin>(
    stream: &mut S,
    window: Duration,
) -> Result<Vec<u8>, PortError> {
    let deadline = Instant::now() + window;
    let mut collected = Vec::new();
    let mut buf = [0u8; 256];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(collected);
        }
        match timeout(remaining.min(READ_DEADLINE), stream.read(&mut buf)).await {
            Ok(Ok(0)) => {
                return Err(PortError::Open("serial stream closed during init".to_string()))
            }
            Ok(Ok(n)) => {
                collected.extend_from_slice(&buf[..n]);
                if has_terminator_lenient(&collected) {
                    return Ok(collected);
                }
            }
            Ok(Err(e)) => return Err(PortError::Open(format!("init handshake: {e}"))),
            Err(_) => continue,
        }
    }
}
