//! Request multiplexer.
//!
//! Issues numbered requests over the session channel and routes incoming
//! responses to the matching pending request. Responses may arrive in any
//! order relative to send order; each pending request resolves independently
//! and exactly once. Teardown fails every outstanding request with
//! [`SkiffError::SessionClosed`].

use super::channel::DuplexChannel;
use super::message::{self, Request, Response, MAX_FRAME_SIZE};
use skiff_platform::{SkiffError, SkiffResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default cap on concurrently in-flight requests per session.
pub const DEFAULT_MAX_INFLIGHT: usize = 64;

/// Correlation table shared between submitters and the reader task.
struct PendingMap {
    /// False once the session is torn down; no new entries accepted.
    open: bool,
    /// Correlation id -> single-assignment result slot.
    slots: HashMap<u32, oneshot::Sender<Response>>,
}

/// A request that has been written to the channel and awaits its response.
///
/// Holds the in-flight permit for its lifetime, so backpressure releases
/// only when the response arrives (or the reply is dropped).
pub struct PendingReply {
    rx: oneshot::Receiver<Response>,
    _permit: OwnedSemaphorePermit,
}

impl PendingReply {
    /// Waits for the matching response.
    ///
    /// Fails with [`SkiffError::SessionClosed`] if the session tears down
    /// before the response arrives.
    pub async fn recv(self) -> SkiffResult<Response> {
        self.rx.await.map_err(|_| SkiffError::SessionClosed)
    }
}

/// Multiplexes correlated requests over one duplex channel.
pub struct RequestMultiplexer {
    /// Write half of the channel; all outgoing frames serialize through here
    writer: Mutex<WriteHalf<DuplexChannel>>,
    /// Pending request table
    pending: Arc<StdMutex<PendingMap>>,
    /// Correlation id counter
    next_request_id: AtomicU32,
    /// Bounds concurrently in-flight requests; waiters are served FIFO
    inflight: Arc<Semaphore>,
    /// In-flight cap the semaphore was created with
    max_inflight: usize,
    /// Reader task handle
    reader_task: StdMutex<Option<JoinHandle<()>>>,
}

impl RequestMultiplexer {
    /// Starts a multiplexer over `channel`, spawning the reader task.
    ///
    /// `max_inflight` bounds the number of requests awaiting responses;
    /// `submit` suspends (FIFO among waiters) when the bound is reached.
    pub fn start(channel: DuplexChannel, max_inflight: usize) -> Self {
        let (read_half, write_half) = tokio::io::split(channel);

        let pending = Arc::new(StdMutex::new(PendingMap {
            open: true,
            slots: HashMap::new(),
        }));

        let reader_pending = Arc::clone(&pending);
        let handle = tokio::spawn(async move {
            Self::read_loop(read_half, reader_pending).await;
        });

        let max_inflight = max_inflight.max(1);
        Self {
            writer: Mutex::new(write_half),
            pending,
            next_request_id: AtomicU32::new(1),
            inflight: Arc::new(Semaphore::new(max_inflight)),
            max_inflight,
            reader_task: StdMutex::new(Some(handle)),
        }
    }

    /// Maximum number of requests this multiplexer keeps in flight.
    ///
    /// Callers holding several un-awaited replies at once (the transfer
    /// window) must stay below this bound or they starve themselves.
    pub fn max_inflight(&self) -> usize {
        self.max_inflight
    }

    /// Issues a request and returns a handle to its eventual response.
    ///
    /// Allocates a fresh correlation id, registers the pending slot, writes
    /// the encoded frame, and returns without waiting for the response.
    pub async fn submit(&self, request: Request) -> SkiffResult<PendingReply> {
        let permit = Arc::clone(&self.inflight)
            .acquire_owned()
            .await
            .map_err(|_| SkiffError::SessionClosed)?;

        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().expect("pending map lock");
            if !pending.open {
                return Err(SkiffError::SessionClosed);
            }
            pending.slots.insert(id, tx);
        }

        let frame = request.encode(id);
        let write_result = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(&frame).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };

        if let Err(e) = write_result {
            let mut pending = self.pending.lock().expect("pending map lock");
            pending.slots.remove(&id);
            return Err(SkiffError::Io(e));
        }

        Ok(PendingReply {
            rx,
            _permit: permit,
        })
    }

    /// Whether the multiplexer has stopped accepting requests, either via
    /// [`shutdown`](Self::shutdown) or because the channel was lost.
    pub fn is_closed(&self) -> bool {
        !self.pending.lock().expect("pending map lock").open
    }

    /// Tears the multiplexer down.
    ///
    /// Aborts the reader task and fails every pending request with
    /// [`SkiffError::SessionClosed`]. Idempotent.
    pub fn shutdown(&self) {
        self.inflight.close();

        if let Some(handle) = self.reader_task.lock().expect("reader task lock").take() {
            handle.abort();
        }

        let drained = {
            let mut pending = self.pending.lock().expect("pending map lock");
            pending.open = false;
            pending.slots.drain().count()
        };
        if drained > 0 {
            debug!("Failed {} pending requests on shutdown", drained);
        }
    }

    /// Reader task body: decode frames and resolve matching pending slots.
    async fn read_loop(
        mut read_half: ReadHalf<DuplexChannel>,
        pending: Arc<StdMutex<PendingMap>>,
    ) {
        debug!("Multiplexer reader started");

        loop {
            let mut length_bytes = [0u8; 4];
            if let Err(e) = read_half.read_exact(&mut length_bytes).await {
                debug!("Channel read ended: {}", e);
                break;
            }
            let frame_length = u32::from_be_bytes(length_bytes) as usize;

            if frame_length == 0 || frame_length > MAX_FRAME_SIZE {
                warn!("Invalid frame length {}, closing session", frame_length);
                break;
            }

            let mut body = vec![0u8; frame_length];
            if let Err(e) = read_half.read_exact(&mut body).await {
                debug!("Channel read ended mid-frame: {}", e);
                break;
            }

            let (id, response) = match message::decode_response(&body) {
                Ok(decoded) => decoded,
                Err(e) => {
                    // A single malformed frame is logged and skipped; the
                    // session only dies if the stream itself fails.
                    warn!("Discarding malformed frame: {}", e);
                    continue;
                }
            };

            let slot = {
                let mut pending = pending.lock().expect("pending map lock");
                pending.slots.remove(&id)
            };

            match slot {
                Some(tx) => {
                    if tx.send(response).is_err() {
                        debug!("Requester for id {} went away before response", id);
                    }
                }
                None => {
                    warn!("Stale or duplicate response for request {}, discarding", id);
                }
            }
        }

        // Channel is gone; fail everything still waiting.
        let drained = {
            let mut pending = pending.lock().expect("pending map lock");
            pending.open = false;
            pending.slots.drain().count()
        };
        if drained > 0 {
            warn!("Channel lost with {} requests in flight", drained);
        }

        debug!("Multiplexer reader stopped");
    }
}

impl Drop for RequestMultiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp::types::StatusCode;
    use std::time::Duration;
    use tokio::io::{AsyncRead, AsyncWrite};

    async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
        let mut length_bytes = [0u8; 4];
        stream.read_exact(&mut length_bytes).await.unwrap();
        let length = u32::from_be_bytes(length_bytes) as usize;
        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).await.unwrap();
        body
    }

    async fn write_response<S: AsyncWrite + Unpin>(stream: &mut S, id: u32, response: Response) {
        stream.write_all(&response.encode(id)).await.unwrap();
        stream.flush().await.unwrap();
    }

    fn stat_request(path: &str) -> Request {
        Request::Stat {
            path: path.to_string(),
        }
    }

    #[tokio::test]
    async fn test_out_of_order_responses_resolve_matching_requests() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mux = RequestMultiplexer::start(Box::new(client), DEFAULT_MAX_INFLIGHT);

        let first = mux.submit(stat_request("/a")).await.unwrap();
        let second = mux.submit(stat_request("/b")).await.unwrap();

        let (id_a, _) = message::decode_request(&read_frame(&mut server).await).unwrap();
        let (id_b, _) = message::decode_request(&read_frame(&mut server).await).unwrap();

        // Answer in reverse order.
        write_response(
            &mut server,
            id_b,
            Response::Status {
                code: StatusCode::NoSuchFile,
                message: "No such file".to_string(),
            },
        )
        .await;
        write_response(
            &mut server,
            id_a,
            Response::Status {
                code: StatusCode::Ok,
                message: String::new(),
            },
        )
        .await;

        match second.recv().await.unwrap() {
            Response::Status { code, .. } => assert_eq!(code, StatusCode::NoSuchFile),
            other => panic!("Expected Status, got {:?}", other),
        }
        match first.recv().await.unwrap() {
            Response::Status { code, .. } => assert_eq!(code, StatusCode::Ok),
            other => panic!("Expected Status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_response_discarded_without_killing_session() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mux = RequestMultiplexer::start(Box::new(client), DEFAULT_MAX_INFLIGHT);

        let reply = mux.submit(stat_request("/a")).await.unwrap();
        let (id, _) = message::decode_request(&read_frame(&mut server).await).unwrap();

        // A response nobody asked for, then the real one.
        write_response(
            &mut server,
            id + 1000,
            Response::Status {
                code: StatusCode::Failure,
                message: "bogus".to_string(),
            },
        )
        .await;
        write_response(
            &mut server,
            id,
            Response::Status {
                code: StatusCode::Ok,
                message: String::new(),
            },
        )
        .await;

        match reply.recv().await.unwrap() {
            Response::Status { code, .. } => assert_eq!(code, StatusCode::Ok),
            other => panic!("Expected Status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_with_session_closed() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mux = RequestMultiplexer::start(Box::new(client), DEFAULT_MAX_INFLIGHT);

        let reply = mux.submit(stat_request("/a")).await.unwrap();
        let _ = read_frame(&mut server).await;

        mux.shutdown();

        assert!(matches!(reply.recv().await, Err(SkiffError::SessionClosed)));
        assert!(matches!(
            mux.submit(stat_request("/b")).await,
            Err(SkiffError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_channel_eof_fails_pending() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mux = RequestMultiplexer::start(Box::new(client), DEFAULT_MAX_INFLIGHT);

        let reply = mux.submit(stat_request("/a")).await.unwrap();
        let _ = read_frame(&mut server).await;

        drop(server);

        assert!(matches!(reply.recv().await, Err(SkiffError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_backpressure_caps_in_flight_requests() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mux = Arc::new(RequestMultiplexer::start(Box::new(client), 1));
        assert_eq!(mux.max_inflight(), 1);

        let first = mux.submit(stat_request("/a")).await.unwrap();
        let (first_id, _) = message::decode_request(&read_frame(&mut server).await).unwrap();

        // Second submit must suspend until the first response frees a slot.
        let mux2 = Arc::clone(&mux);
        let mut blocked = tokio::spawn(async move { mux2.submit(stat_request("/b")).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        write_response(
            &mut server,
            first_id,
            Response::Status {
                code: StatusCode::Ok,
                message: String::new(),
            },
        )
        .await;
        first.recv().await.unwrap();

        let second = tokio::time::timeout(Duration::from_secs(1), &mut blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        drop(second);
    }
}
