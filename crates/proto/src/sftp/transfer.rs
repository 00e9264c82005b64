//! Transfer engine.
//!
//! Implements `put` (local path / buffer / stream -> remote file) and `get`
//! (remote file -> local path / buffer / stream) as chunked request loops
//! over the request multiplexer. One transfer owns its remote handle for the
//! duration of the task and releases it exactly once, including on error
//! paths. Offsets within a task are monotonically increasing; with
//! `concurrency > 1` up to that many requests are in flight over disjoint
//! ranges.
//!
//! Partially transferred remote files are left as-is on failure. Callers
//! needing atomicity should upload to a temporary remote path and rename
//! once the transfer resolves.

use super::message::{Request, Response, MAX_FRAME_SIZE};
use super::mux::{PendingReply, RequestMultiplexer};
use super::session::normalize_status;
use super::types::{FileAttributes, FileOpenFlags, StatusCode};
use skiff_platform::{SkiffError, SkiffResult};
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Default transfer chunk size (32 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Largest permitted chunk size.
///
/// Leaves room for frame headers within [`MAX_FRAME_SIZE`]; the wire length
/// field for a chunk is a `u32`, so larger values could not be requested
/// faithfully anyway.
pub const MAX_CHUNK_SIZE: usize = MAX_FRAME_SIZE - 1024;

/// Progress callback: (total bytes transferred, bytes in this chunk,
/// total bytes when known up front).
pub type StepCallback = Box<dyn Fn(u64, usize, Option<u64>) + Send + Sync>;

/// Source of a `put` operation.
pub enum PutSource {
    /// A local file opened for reading.
    LocalFile(PathBuf),
    /// A complete in-memory byte sequence.
    Buffer(Vec<u8>),
    /// A lazy byte stream, consumed incrementally.
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl From<Vec<u8>> for PutSource {
    fn from(data: Vec<u8>) -> Self {
        PutSource::Buffer(data)
    }
}

impl From<&[u8]> for PutSource {
    fn from(data: &[u8]) -> Self {
        PutSource::Buffer(data.to_vec())
    }
}

impl From<PathBuf> for PutSource {
    fn from(path: PathBuf) -> Self {
        PutSource::LocalFile(path)
    }
}

impl From<&Path> for PutSource {
    fn from(path: &Path) -> Self {
        PutSource::LocalFile(path.to_path_buf())
    }
}

impl fmt::Debug for PutSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PutSource::LocalFile(path) => f.debug_tuple("LocalFile").field(path).finish(),
            PutSource::Buffer(data) => write!(f, "Buffer({} bytes)", data.len()),
            PutSource::Reader(_) => write!(f, "Reader(..)"),
        }
    }
}

/// Destination of a `get` operation.
pub enum GetTarget {
    /// A local file created (or truncated) for writing.
    LocalFile(PathBuf),
    /// Collect the content into an in-memory buffer.
    Buffer,
    /// An arbitrary writable stream.
    Writer(Box<dyn AsyncWrite + Send + Unpin>),
}

impl fmt::Debug for GetTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GetTarget::LocalFile(path) => f.debug_tuple("LocalFile").field(path).finish(),
            GetTarget::Buffer => write!(f, "Buffer"),
            GetTarget::Writer(_) => write!(f, "Writer(..)"),
        }
    }
}

/// Result of a `get` operation.
#[derive(Debug)]
pub enum GetOutcome {
    /// Bytes written to a local file or writer target.
    Written(u64),
    /// Downloaded content, for [`GetTarget::Buffer`].
    Buffer(Vec<u8>),
}

impl GetOutcome {
    /// Total bytes transferred.
    pub fn len(&self) -> u64 {
        match self {
            GetOutcome::Written(count) => *count,
            GetOutcome::Buffer(data) => data.len() as u64,
        }
    }

    /// Whether nothing was transferred.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Options for a single transfer task.
pub struct TransferOptions {
    /// Permission bits for created remote files (server default when unset).
    pub mode: Option<u32>,
    /// Bytes per Read/Write request.
    pub chunk_size: usize,
    /// Maximum requests in flight for this task.
    pub concurrency: usize,
    /// Progress callback invoked as each chunk completes.
    pub step: Option<StepCallback>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            mode: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: 1,
            step: None,
        }
    }
}

impl TransferOptions {
    /// Creates default transfer options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the permission bits for created remote files.
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Sets the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Sets the number of requests kept in flight.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the progress callback.
    pub fn with_step<F>(mut self, step: F) -> Self
    where
        F: Fn(u64, usize, Option<u64>) + Send + Sync + 'static,
    {
        self.step = Some(Box::new(step));
        self
    }

    fn validate(&self) -> SkiffResult<()> {
        if self.chunk_size == 0 {
            return Err(SkiffError::Config("chunk_size must be positive".to_string()));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(SkiffError::Config(format!(
                "chunk_size must not exceed {}",
                MAX_CHUNK_SIZE
            )));
        }
        if self.concurrency == 0 {
            return Err(SkiffError::Config(
                "concurrency must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// Manual Debug implementation because StepCallback is not Debug
impl fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOptions")
            .field("mode", &self.mode)
            .field("chunk_size", &self.chunk_size)
            .field("concurrency", &self.concurrency)
            .field("step", &self.step.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

/// Phase of a transfer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferState {
    /// Resolving the source and opening the remote handle
    Opening,
    /// Chunk loop in progress
    Transferring,
    /// Releasing the remote handle
    Closing,
    /// Completed successfully
    Done,
    /// Failed; handle released best-effort
    Failed,
}

/// Execution state of one put or get operation.
struct TransferTask<'a> {
    mux: &'a RequestMultiplexer,
    op: &'static str,
    remote: String,
    state: TransferState,
    handle: Option<Vec<u8>>,
}

impl<'a> TransferTask<'a> {
    fn new(mux: &'a RequestMultiplexer, op: &'static str, remote: &str) -> Self {
        Self {
            mux,
            op,
            remote: remote.to_string(),
            state: TransferState::Opening,
            handle: None,
        }
    }

    fn enter(&mut self, state: TransferState) {
        debug!("{} {}: {:?} -> {:?}", self.op, self.remote, self.state, state);
        self.state = state;
    }

    /// Opens the remote path, storing the handle on success.
    async fn open(&mut self, flags: FileOpenFlags, attrs: FileAttributes) -> SkiffResult<()> {
        let reply = self
            .mux
            .submit(Request::Open {
                path: self.remote.clone(),
                flags,
                attrs,
            })
            .await?;

        match reply.recv().await? {
            Response::Handle(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Response::Status { code, message } => {
                Err(normalize_status(self.op, &self.remote, code, &message))
            }
            other => Err(SkiffError::Protocol(format!(
                "Unexpected response to Open: {:?}",
                other
            ))),
        }
    }

    fn handle(&self) -> SkiffResult<Vec<u8>> {
        self.handle
            .clone()
            .ok_or_else(|| SkiffError::Protocol("Transfer has no open handle".to_string()))
    }

    /// Releases the remote handle; the handle is gone afterwards regardless
    /// of the server's answer.
    async fn close(&mut self) -> SkiffResult<()> {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return Ok(()),
        };

        let reply = self.mux.submit(Request::Close { handle }).await?;
        match reply.recv().await? {
            Response::Status {
                code: StatusCode::Ok,
                ..
            } => Ok(()),
            Response::Status { code, message } => {
                Err(normalize_status(self.op, &self.remote, code, &message))
            }
            other => Err(SkiffError::Protocol(format!(
                "Unexpected response to Close: {:?}",
                other
            ))),
        }
    }

    /// Best-effort close on the error path; failures are logged, never
    /// propagated over the original error.
    async fn abort(&mut self) {
        self.enter(TransferState::Failed);
        if self.handle.is_some() {
            if let Err(e) = self.close().await {
                debug!("{} {}: close after failure: {}", self.op, self.remote, e);
            }
        }
    }
}

/// Uploads `source` to `remote`, resolving to the destination path.
pub async fn put(
    mux: &RequestMultiplexer,
    source: PutSource,
    remote: &str,
    options: TransferOptions,
) -> SkiffResult<String> {
    options.validate()?;

    // The source must resolve before any remote request goes out; a missing
    // local file never reaches the server.
    let (reader, total) = resolve_source(source).await?;

    info!("put {} ({:?} bytes)", remote, total);
    let mut task = TransferTask::new(mux, "put", remote);

    match put_inner(&mut task, reader, total, &options).await {
        Ok(()) => {
            task.enter(TransferState::Done);
            Ok(remote.to_string())
        }
        Err(e) => {
            task.abort().await;
            Err(e)
        }
    }
}

async fn put_inner(
    task: &mut TransferTask<'_>,
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    total: Option<u64>,
    options: &TransferOptions,
) -> SkiffResult<()> {
    let attrs = options
        .mode
        .map(FileAttributes::with_permissions)
        .unwrap_or_default();
    task.open(FileOpenFlags::write_create(), attrs).await?;

    task.enter(TransferState::Transferring);
    let handle = task.handle()?;

    // Un-awaited replies hold their in-flight permits, so a window wider
    // than the session cap would starve its own submits.
    let window_limit = options.concurrency.min(task.mux.max_inflight());

    let mut window: VecDeque<(PendingReply, usize)> = VecDeque::new();
    let mut offset: u64 = 0;
    let mut transferred: u64 = 0;

    loop {
        let chunk = read_chunk(&mut reader, options.chunk_size).await?;
        if chunk.is_empty() {
            break;
        }
        let chunk_len = chunk.len();

        while window.len() >= window_limit {
            complete_write(task, &mut window, &mut transferred, total, options).await?;
        }

        let reply = task
            .mux
            .submit(Request::Write {
                handle: handle.clone(),
                offset,
                data: chunk,
            })
            .await?;
        window.push_back((reply, chunk_len));
        offset += chunk_len as u64;

        if chunk_len < options.chunk_size {
            // Short read from the source means it is exhausted.
            break;
        }
    }

    while !window.is_empty() {
        complete_write(task, &mut window, &mut transferred, total, options).await?;
    }

    task.enter(TransferState::Closing);
    task.close().await?;

    info!("put {} complete ({} bytes)", task.remote, transferred);
    Ok(())
}

/// Awaits the oldest in-flight write and reports progress.
async fn complete_write(
    task: &TransferTask<'_>,
    window: &mut VecDeque<(PendingReply, usize)>,
    transferred: &mut u64,
    total: Option<u64>,
    options: &TransferOptions,
) -> SkiffResult<()> {
    let (reply, chunk_len) = match window.pop_front() {
        Some(entry) => entry,
        None => return Ok(()),
    };

    match reply.recv().await? {
        Response::Status {
            code: StatusCode::Ok,
            ..
        } => {
            *transferred += chunk_len as u64;
            if let Some(step) = &options.step {
                step(*transferred, chunk_len, total);
            }
            Ok(())
        }
        Response::Status { code, message } => {
            Err(normalize_status(task.op, &task.remote, code, &message))
        }
        other => Err(SkiffError::Protocol(format!(
            "Unexpected response to Write: {:?}",
            other
        ))),
    }
}

/// Downloads `remote` into `target`.
pub async fn get(
    mux: &RequestMultiplexer,
    remote: &str,
    target: GetTarget,
    options: TransferOptions,
) -> SkiffResult<GetOutcome> {
    options.validate()?;

    let mut sink = Sink::open(target).await?;

    info!("get {}", remote);
    let mut task = TransferTask::new(mux, "get", remote);

    match get_inner(&mut task, &mut sink, &options).await {
        Ok(transferred) => {
            task.enter(TransferState::Done);
            sink.finish(transferred).await
        }
        Err(e) => {
            task.abort().await;
            Err(e)
        }
    }
}

async fn get_inner(
    task: &mut TransferTask<'_>,
    sink: &mut Sink,
    options: &TransferOptions,
) -> SkiffResult<u64> {
    task.open(FileOpenFlags::read_only(), FileAttributes::new())
        .await?;

    task.enter(TransferState::Transferring);
    let handle = task.handle()?;

    // Size is advisory, for the progress callback only.
    let total = if options.step.is_some() {
        stat_size(task).await
    } else {
        None
    };

    let chunk_size = options.chunk_size as u32;
    let window_limit = options.concurrency.min(task.mux.max_inflight());
    let mut window: VecDeque<(PendingReply, u64)> = VecDeque::new();
    let mut issue_offset: u64 = 0;
    let mut write_offset: u64 = 0;
    let mut eof = false;

    while !eof || !window.is_empty() {
        while !eof && window.len() < window_limit {
            let reply = task
                .mux
                .submit(Request::Read {
                    handle: handle.clone(),
                    offset: issue_offset,
                    length: chunk_size,
                })
                .await?;
            window.push_back((reply, issue_offset));
            issue_offset += chunk_size as u64;
        }

        let (reply, requested_offset) = match window.pop_front() {
            Some(entry) => entry,
            None => break,
        };

        match reply.recv().await? {
            Response::Data(data) => {
                if data.is_empty() {
                    eof = true;
                    window.clear();
                    continue;
                }
                debug_assert_eq!(requested_offset, write_offset);

                sink.write_all(&data).await?;
                write_offset += data.len() as u64;
                if let Some(step) = &options.step {
                    step(write_offset, data.len(), total);
                }

                if (data.len() as u32) < chunk_size {
                    // Short read: prefetched requests past this point assumed
                    // a full chunk, so their offsets no longer line up.
                    // Discard them and reissue from the corrected offset.
                    window.clear();
                    issue_offset = write_offset;
                }
            }
            Response::Status {
                code: StatusCode::Eof,
                ..
            } => {
                eof = true;
                window.clear();
            }
            Response::Status { code, message } => {
                return Err(normalize_status(task.op, &task.remote, code, &message));
            }
            other => {
                return Err(SkiffError::Protocol(format!(
                    "Unexpected response to Read: {:?}",
                    other
                )));
            }
        }
    }

    task.enter(TransferState::Closing);
    task.close().await?;

    info!("get {} complete ({} bytes)", task.remote, write_offset);
    Ok(write_offset)
}

/// Asks the server for the remote file size; failures are advisory only.
async fn stat_size(task: &TransferTask<'_>) -> Option<u64> {
    let reply = task
        .mux
        .submit(Request::Stat {
            path: task.remote.clone(),
        })
        .await
        .ok()?;
    match reply.recv().await.ok()? {
        Response::Attrs(attrs) => attrs.size,
        _ => None,
    }
}

/// Resolves a put source into a readable stream and its known length.
async fn resolve_source(
    source: PutSource,
) -> SkiffResult<(Box<dyn AsyncRead + Send + Unpin>, Option<u64>)> {
    match source {
        PutSource::LocalFile(path) => {
            let file = fs::File::open(&path)
                .await
                .map_err(|e| local_source_error(&path, e))?;
            let len = file.metadata().await?.len();
            Ok((Box::new(file), Some(len)))
        }
        PutSource::Buffer(data) => {
            let len = data.len() as u64;
            Ok((Box::new(std::io::Cursor::new(data)), Some(len)))
        }
        PutSource::Reader(reader) => Ok((reader, None)),
    }
}

fn local_source_error(path: &Path, err: std::io::Error) -> SkiffError {
    if err.kind() == std::io::ErrorKind::NotFound {
        SkiffError::Transfer {
            op: "put".to_string(),
            path: path.display().to_string(),
            message: "no such file or directory".to_string(),
        }
    } else {
        SkiffError::Io(err)
    }
}

/// Reads from `reader` until `chunk_size` bytes are buffered or the stream
/// ends.
async fn read_chunk(
    reader: &mut Box<dyn AsyncRead + Send + Unpin>,
    chunk_size: usize,
) -> SkiffResult<Vec<u8>> {
    let mut chunk = vec![0u8; chunk_size];
    let mut filled = 0;

    while filled < chunk_size {
        let count = reader.read(&mut chunk[filled..]).await?;
        if count == 0 {
            break;
        }
        filled += count;
    }

    chunk.truncate(filled);
    Ok(chunk)
}

/// Byte sink behind a get target.
enum Sink {
    File(fs::File),
    Buffer(Vec<u8>),
    Writer(Box<dyn AsyncWrite + Send + Unpin>),
}

impl Sink {
    async fn open(target: GetTarget) -> SkiffResult<Self> {
        match target {
            GetTarget::LocalFile(path) => {
                let file = fs::File::create(&path).await?;
                Ok(Sink::File(file))
            }
            GetTarget::Buffer => Ok(Sink::Buffer(Vec::new())),
            GetTarget::Writer(writer) => Ok(Sink::Writer(writer)),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> SkiffResult<()> {
        match self {
            Sink::File(file) => file.write_all(data).await?,
            Sink::Buffer(buffer) => buffer.extend_from_slice(data),
            Sink::Writer(writer) => writer.write_all(data).await?,
        }
        Ok(())
    }

    async fn finish(self, transferred: u64) -> SkiffResult<GetOutcome> {
        match self {
            Sink::File(mut file) => {
                file.flush().await?;
                Ok(GetOutcome::Written(transferred))
            }
            Sink::Buffer(buffer) => Ok(GetOutcome::Buffer(buffer)),
            Sink::Writer(mut writer) => {
                writer.flush().await?;
                Ok(GetOutcome::Written(transferred))
            }
        }
    }
}
