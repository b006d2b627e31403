//! Streaming relay: one TCP frame stream per device, fanned out to N clients.
//!
//! A device exposes a single TCP socket emitting length-prefixed JPEG frames
//! and tolerates exactly one consumer. The relay owns that connection with a
//! single background reader and hands every HTTP client a bounded queue of
//! MJPEG parts. The reader never blocks on a slow client: full queues drop
//! the frame. When the last client leaves, the reader lingers for a short
//! grace period and then closes the socket; the next client reopens it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::StreamingConfig;

/// Frames larger than this are a protocol violation, not an image.
const MAX_FRAME_LEN: u64 = 32 * 1024 * 1024;

const MJPEG_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

/// Read one frame: an 8-byte little-endian length, then exactly that many
/// bytes of payload. `Ok(None)` is a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 8];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let len = u64::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds the {MAX_FRAME_LEN} byte limit"),
        ));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Wrap JPEG bytes as one multipart MJPEG part.
pub fn mjpeg_part(frame: &[u8]) -> Vec<u8> {
    let mut part = Vec::with_capacity(MJPEG_HEADER.len() + frame.len() + 2);
    part.extend_from_slice(MJPEG_HEADER);
    part.extend_from_slice(frame);
    part.extend_from_slice(b"\r\n");
    part
}

/// Probe whether an idle device socket is still usable.
///
/// A zero-timeout peek: nothing readable yet means the connection is simply
/// quiet (healthy); a clean EOF or any error means the device hung up and the
/// connection must be recycled.
pub async fn is_socket_healthy(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 1];
    match tokio::time::timeout(Duration::ZERO, stream.peek(&mut buf)).await {
        // Would block: no data pending, socket alive.
        Err(_elapsed) => true,
        Ok(Ok(0)) => false,
        Ok(Ok(_)) => true,
        Ok(Err(_)) => false,
    }
}

type ClientMap = std::sync::Mutex<HashMap<u64, mpsc::Sender<Vec<u8>>>>;

/// Deliver a part to every registered client without ever blocking.
///
/// A full queue drops this frame for that client but keeps the registration;
/// a closed queue (client gone) removes it. Returns how many clients remain.
fn fan_out(clients: &ClientMap, part: &[u8]) -> usize {
    let mut clients = clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    clients.retain(|id, tx| match tx.try_send(part.to_vec()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!(client = *id, "client queue full, dropping frame");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(client = *id, "client gone, unregistering");
            false
        }
    });
    clients.len()
}

struct RelayShared {
    clients: ClientMap,
    next_client_id: AtomicU64,
    reader_active: AtomicBool,
}

/// One client's view of the relayed stream.
pub struct StreamClient {
    id: u64,
    rx: mpsc::Receiver<Vec<u8>>,
    shared: Arc<RelayShared>,
}

impl StreamClient {
    /// Next MJPEG part, in device order. `None` once the relay shut the
    /// connection down.
    pub async fn next_part(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        let mut clients = self
            .shared
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        clients.remove(&self.id);
    }
}

/// Relay for a single device's frame stream.
pub struct StreamRelay {
    addr: String,
    queue_capacity: usize,
    grace: Duration,
    shared: Arc<RelayShared>,
    // Serialises "is the reader running?" decisions across subscribers.
    start_lock: tokio::sync::Mutex<()>,
}

impl StreamRelay {
    pub fn new(ip: &str, config: &StreamingConfig) -> Self {
        StreamRelay {
            addr: format!("{ip}:{}", config.port),
            queue_capacity: config.queue_capacity,
            grace: Duration::from_secs(config.grace_secs),
            shared: Arc::new(RelayShared {
                clients: std::sync::Mutex::new(HashMap::new()),
                next_client_id: AtomicU64::new(0),
                reader_active: AtomicBool::new(false),
            }),
            start_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Register a client, starting the TCP reader if it is not running.
    pub async fn subscribe(&self) -> std::io::Result<StreamClient> {
        let _guard = self.start_lock.lock().await;

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = self.shared.next_client_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut clients = self
                .shared
                .clients
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            clients.insert(id, tx);
        }

        if !self.shared.reader_active.load(Ordering::Acquire) {
            let stream = match TcpStream::connect(&self.addr).await {
                Ok(stream) => stream,
                Err(err) => {
                    // Connection failed: take the registration back out.
                    let mut clients = self
                        .shared
                        .clients
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    clients.remove(&id);
                    return Err(err);
                }
            };
            stream.set_nodelay(true)?;

            self.shared.reader_active.store(true, Ordering::Release);
            let shared = Arc::clone(&self.shared);
            let addr = self.addr.clone();
            let grace = self.grace;
            tokio::spawn(async move {
                run_reader(stream, &shared, grace, &addr).await;
            });
            info!(addr = %self.addr, "stream reader started");
        }

        Ok(StreamClient {
            id,
            rx,
            shared: Arc::clone(&self.shared),
        })
    }

    pub fn client_count(&self) -> usize {
        self.shared
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_reading(&self) -> bool {
        self.shared.reader_active.load(Ordering::Acquire)
    }
}

/// The single reader loop that owns the device connection.
async fn run_reader(mut stream: TcpStream, shared: &RelayShared, grace: Duration, addr: &str) {
    let mut empty_since: Option<Instant> = None;

    loop {
        // With no clients left the read is bounded so the grace period is
        // honoured even if the device goes quiet.
        let frame = if empty_since.is_some() {
            match tokio::time::timeout(grace, read_frame(&mut stream)).await {
                Ok(result) => result,
                Err(_elapsed) => Ok(None),
            }
        } else {
            read_frame(&mut stream).await
        };

        match frame {
            Ok(Some(payload)) => {
                let remaining = fan_out(&shared.clients, &mjpeg_part(&payload));
                if remaining > 0 {
                    empty_since = None;
                } else {
                    let since = *empty_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= grace {
                        info!(addr = %addr, "no clients left, closing device stream");
                        break;
                    }
                }
            }
            Ok(None) => {
                // EOF from the device, or the grace timeout fired. Either
                // way this connection is done.
                if empty_since.is_none() {
                    debug!(addr = %addr, "device closed the frame stream");
                } else {
                    info!(addr = %addr, "grace period expired, closing device stream");
                }
                break;
            }
            Err(err) => {
                warn!(addr = %addr, error = %err, "stream read failed");
                break;
            }
        }
    }

    // Dropping the senders wakes every remaining client with end-of-stream.
    shared
        .clients
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clear();
    shared.reader_active.store(false, Ordering::Release);
}
