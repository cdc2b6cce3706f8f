use crate::config::SerialConfig;
use crate::serial::cache::CommandCache;
use crate::serial::daemon::{classify, effective_timeout, ActiveRequests, PortDaemon};
use crate::serial::port::open_port;
use crate::serial::types::{PortError, SerialRequest, SerialResponse};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant};
use tracing::log::{debug, error, info, warn};

const RESTART_INTERVAL: Duration = Duration::from_secs(3);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);
const WATCHDOG_STALL_THRESHOLD: Duration = Duration::from_secs(30);

type CurrentDaemon = Arc<Mutex<Option<Arc<PortDaemon>>>>;

/// Keeps exactly one port daemon alive for the configured device, restarting
/// it with backoff when it dies. Callers are gated until the first daemon is
/// up, and all cacheable queries go through the shared command cache.
pub struct SerialSupervisor {
    current: CurrentDaemon,
    cache: Arc<CommandCache>,
    started_rx: watch::Receiver<bool>,
    quit_tx: watch::Sender<bool>,
}
impl SerialSupervisor {
    /// Supervise the native serial device from the configuration.
    pub fn start(config: SerialConfig) -> Self {
        let port = config.port.clone();
        let baud_rate = config.baud_rate;
        Self::with_opener(config, move || {
            let port = port.clone();
            async move { open_port(&port, baud_rate) }
        })
    }

    /// Supervise daemons over streams produced by `opener`. Split out from
    /// `start` so tests can supply in-memory streams.
    pub fn with_opener<S, F, Fut>(config: SerialConfig, mut opener: F) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<S, PortError>> + Send,
    {
        let current: CurrentDaemon = Arc::new(Mutex::new(None));
        let cache = Arc::new(CommandCache::new());
        let (started_tx, started_rx) = watch::channel(false);
        let (quit_tx, mut quit_rx) = watch::channel(false);

        let supervised = Arc::clone(&current);
        let sweeper = cache.start_sweeper();
        tokio::spawn(async move {
            loop {
                let stream = match opener().await {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!("failed to open serial port: {e}");
                        if wait_or_quit(&mut quit_rx, RESTART_INTERVAL).await {
                            break;
                        }
                        continue;
                    }
                };

                let (daemon, mut daemon_done) = match PortDaemon::start(
                    stream,
                    config.cmd_channel_buffer_size,
                    config.read_buffer_size,
                )
                .await
                {
                    Ok(started) => started,
                    Err(e) => {
                        error!("failed to start port daemon: {e}");
                        if wait_or_quit(&mut quit_rx, RESTART_INTERVAL).await {
                            break;
                        }
                        continue;
                    }
                };

                let daemon = Arc::new(daemon);
                *supervised.lock().expect("daemon slot poisoned") = Some(Arc::clone(&daemon));
                started_tx.send_replace(true);
                info!("port daemon is up");

                let watchdog = spawn_watchdog(daemon.active_requests());

                tokio::select! {
                    _ = &mut daemon_done => {
                        warn!("port daemon went down, restarting after {RESTART_INTERVAL:?}");
                    }
                    _ = quit_rx.changed() => {
                        debug!("supervisor stopping, shutting the daemon down");
                        daemon.stop();
                        let _ = daemon_done.await;
                        watchdog.abort();
                        *supervised.lock().expect("daemon slot poisoned") = None;
                        break;
                    }
                }

                watchdog.abort();
                *supervised.lock().expect("daemon slot poisoned") = None;
                if wait_or_quit(&mut quit_rx, RESTART_INTERVAL).await {
                    break;
                }
            }
            sweeper.abort();
            info!("serial supervisor exited");
        });

        Self {
            current,
            cache,
            started_rx,
            quit_tx,
        }
    }

    /// Issue a request through the cache and coalescer. Blocks until the
    /// first daemon has been published.
    pub async fn query(&self, request: SerialRequest) -> Result<SerialResponse, PortError> {
        self.wait_started().await?;

        let command = String::from_utf8_lossy(&request.data).into_owned();
        let id = request.id;
        // Coalesced waiters get the same classification-based budget as the
        // leader they join, or they would time out while it still works.
        let wait_timeout = effective_timeout(classify(&request.data), request.timeout);
        let data = self
            .cache
            .execute(&command, wait_timeout, || self.forward(request))
            .await?;

        Ok(SerialResponse { id, data })
    }

    /// Issue a request straight to the daemon, bypassing cache and coalescer.
    /// The interactive SMS send handshake must hit the wire every time.
    pub async fn query_uncached(&self, request: SerialRequest) -> Result<SerialResponse, PortError> {
        self.wait_started().await?;
        let id = request.id;
        let data = self.forward(request).await?;
        Ok(SerialResponse { id, data })
    }

    async fn forward(&self, request: SerialRequest) -> Result<Vec<u8>, PortError> {
        let daemon = {
            let slot = self.current.lock().expect("daemon slot poisoned");
            slot.clone()
        };
        let Some(daemon) = daemon else {
            return Err(PortError::NoDaemon);
        };
        daemon.query(request).await.map(|response| response.data)
    }

    async fn wait_started(&self) -> Result<(), PortError> {
        let mut started = self.started_rx.clone();
        while !*started.borrow() {
            started.changed().await.map_err(|_| PortError::Closed)?;
        }
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.quit_tx.send(true);
    }
}

/// Sleep for `wait`, returning true early if the quit signal fires.
async fn wait_or_quit(quit_rx: &mut watch::Receiver<bool>, wait: Duration) -> bool {
    tokio::select! {
        _ = sleep(wait) => false,
        _ = quit_rx.changed() => true,
    }
}

/// Diagnostic only: log requests that have been on the wire suspiciously
/// long. Nothing is terminated; the daemon's own timeout policy decides.
fn spawn_watchdog(active: ActiveRequests) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(WATCHDOG_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let now = Instant::now();
            for (id, started_at) in active.lock().await.iter() {
                let elapsed = now.duration_since(*started_at);
                if elapsed > WATCHDOG_STALL_THRESHOLD {
                    warn!("request #{id} has been in flight for {elapsed:?}");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    fn test_config() -> SerialConfig {
        SerialConfig {
            is_local: true,
            port: "/dev/null".to_string(),
            baud_rate: 115200,
            cmd_channel_buffer_size: 16,
            read_buffer_size: 4096,
        }
    }

    /// Scripted modem half: answers the init handshake, then serves `replies`
    /// responses to successive commands before hanging up.
    fn spawn_mock_modem(mut stream: DuplexStream, replies: Vec<&'static [u8]>) {
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            for _ in 0..3 {
                if stream.read(&mut buf).await.unwrap_or(0) == 0 {
                    return;
                }
                let _ = stream.write_all(b"\r\nOK\r\n").await;
            }
            for reply in replies {
                if stream.read(&mut buf).await.unwrap_or(0) == 0 {
                    return;
                }
                let _ = stream.write_all(reply).await;
            }
            // Hold the port open briefly so in-flight replies land.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
    }

    #[tokio::test]
    async fn test_query_round_trip_through_supervisor() {
        let (opener_tx, mut opener_rx) = mpsc::unbounded_channel::<DuplexStream>();

        let (ours, theirs) = tokio::io::duplex(4096);
        spawn_mock_modem(theirs, vec![b"\r\n+QTEMP: \"cpu0\",\"41\"\r\n\r\nOK\r\n"]);
        opener_tx.send(ours).unwrap();

        let supervisor = SerialSupervisor::with_opener(test_config(), move || {
            let stream = opener_rx.try_recv();
            async move { stream.map_err(|_| PortError::Open("no more streams".to_string())) }
        });

        let response = supervisor
            .query(SerialRequest::new(
                b"AT+QTEMP\r\n".to_vec(),
                Duration::from_secs(2),
            ))
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&response.data).contains("+QTEMP"));

        supervisor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_daemon_restart_after_fatal_error() {
        let (opener_tx, mut opener_rx) = mpsc::unbounded_channel::<DuplexStream>();

        // First daemon: answers one command then drops mid-command.
        let (first, first_modem) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut stream = first_modem;
            let mut buf = [0u8; 512];
            for _ in 0..3 {
                if stream.read(&mut buf).await.unwrap_or(0) == 0 {
                    return;
                }
                let _ = stream.write_all(b"\r\nOK\r\n").await;
            }
            // Swallow the next command and hang up.
            let _ = stream.read(&mut buf).await;
        });

        // Second daemon: healthy.
        let (second, second_modem) = tokio::io::duplex(4096);
        spawn_mock_modem(second_modem, vec![b"\r\n+QSPN: \"carrier\",0,1\r\n\r\nOK\r\n"]);

        opener_tx.send(first).unwrap();
        opener_tx.send(second).unwrap();

        let supervisor = SerialSupervisor::with_opener(test_config(), move || {
            let stream = opener_rx.try_recv();
            async move { stream.map_err(|_| PortError::Open("no more streams".to_string())) }
        });

        let err = supervisor
            .query(SerialRequest::new(
                b"AT+QSPN\r\n".to_vec(),
                Duration::from_secs(2),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::Io(_) | PortError::Timeout));

        // Wait out the restart backoff, then the same query must succeed
        // against the fresh daemon. The error above was not cached.
        tokio::time::sleep(Duration::from_secs(4)).await;
        let response = supervisor
            .query(SerialRequest::new(
                b"AT+QSPN\r\n".to_vec(),
                Duration::from_secs(2),
            ))
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&response.data).contains("+QSPN"));

        supervisor.stop();
    }

    #[tokio::test]
    async fn test_coalesced_callers_share_one_write() {
        let (opener_tx, mut opener_rx) = mpsc::unbounded_channel::<DuplexStream>();
        let (ours, mut modem) = tokio::io::duplex(4096);
        let (writes_tx, mut writes_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            for _ in 0..3 {
                if modem.read(&mut buf).await.unwrap_or(0) == 0 {
                    return;
                }
                let _ = modem.write_all(b"\r\nOK\r\n").await;
            }
            loop {
                let n = match modem.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                writes_tx.send(buf[..n].to_vec()).unwrap();
                // Answer slowly so the second caller coalesces.
                tokio::time::sleep(Duration::from_millis(150)).await;
                let _ = modem
                    .write_all(b"\r\n+QENG: \"servingcell\",\"NOCONN\",\"LTE\",\"FDD\"\r\n\r\nOK\r\n")
                    .await;
            }
        });
        opener_tx.send(ours).unwrap();

        let supervisor = Arc::new(SerialSupervisor::with_opener(test_config(), move || {
            let stream = opener_rx.try_recv();
            async move { stream.map_err(|_| PortError::Open("no more streams".to_string())) }
        }));

        let first = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move {
                supervisor
                    .query(SerialRequest::new(
                        b"AT+QENG=\"servingcell\"\r\n".to_vec(),
                        Duration::from_secs(5),
                    ))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move {
                supervisor
                    .query(SerialRequest::new(
                        b"AT+QENG=\"servingcell\"\r\n".to_vec(),
                        Duration::from_secs(5),
                    ))
                    .await
            })
        };

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.data, second.data);

        // Exactly one command reached the wire.
        assert!(writes_rx.recv().await.is_some());
        assert!(writes_rx.try_recv().is_err());

        supervisor.stop();
    }
}
