//! In-memory test server speaking the file-transfer wire protocol.
//!
//! Serves a `HashMap` file tree over a `tokio::io::duplex` pipe, so
//! integration tests exercise the real client stack (session handshake,
//! multiplexer, transfer engine, codec) without the network.

use skiff_platform::{SkiffError, SkiffResult};
use skiff_proto::sftp::{
    decode_request, encode_version, ChannelProvider, DirEntry, DuplexChannel, FileAttributes,
    FileMode, FileOpenFlags, Request, Response, SessionConfig, SftpClient, StatusCode,
    DEFAULT_MAX_INFLIGHT, PROTOCOL_VERSION,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Shared server state, inspectable from tests.
pub struct MockState {
    files: Mutex<HashMap<String, Vec<u8>>>,
    dirs: Mutex<HashSet<String>>,
    ops: Mutex<Vec<String>>,
    active_handles: AtomicUsize,
    writes_before_failure: Mutex<Option<usize>>,
}

impl MockState {
    pub fn new() -> Arc<Self> {
        let mut dirs = HashSet::new();
        dirs.insert("/".to_string());
        Arc::new(Self {
            files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(dirs),
            ops: Mutex::new(Vec::new()),
            active_handles: AtomicUsize::new(0),
            writes_before_failure: Mutex::new(None),
        })
    }

    /// After `count` successful writes, every further write fails with a
    /// "disk full" status.
    pub fn fail_writes_after(&self, count: usize) {
        *self.writes_before_failure.lock().unwrap() = Some(count);
    }

    pub fn add_dir(&self, path: &str) {
        self.dirs.lock().unwrap().insert(path.to_string());
    }

    pub fn add_file(&self, path: &str, content: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn op_count(&self, op: &str) -> usize {
        self.ops.lock().unwrap().iter().filter(|o| *o == op).count()
    }

    pub fn active_handles(&self) -> usize {
        self.active_handles.load(Ordering::SeqCst)
    }

    fn record(&self, op: &str) {
        self.ops.lock().unwrap().push(op.to_string());
    }
}

fn parent_dir(path: &str) -> String {
    match path.rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
        None => "/".to_string(),
    }
}

enum HandleKind {
    File(String),
    Dir { path: String, served: bool },
}

async fn read_frame(stream: &mut DuplexStream) -> Option<Vec<u8>> {
    let mut length_bytes = [0u8; 4];
    stream.read_exact(&mut length_bytes).await.ok()?;
    let length = u32::from_be_bytes(length_bytes) as usize;
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await.ok()?;
    Some(body)
}

fn status(code: StatusCode, message: &str) -> Response {
    Response::Status {
        code,
        message: message.to_string(),
    }
}

async fn serve(mut stream: DuplexStream, state: Arc<MockState>) {
    // Handshake: Init in, Version out.
    let Some(_init) = read_frame(&mut stream).await else {
        return;
    };
    if stream
        .write_all(&encode_version(PROTOCOL_VERSION))
        .await
        .is_err()
    {
        return;
    }

    let mut handles: HashMap<Vec<u8>, HandleKind> = HashMap::new();
    let mut next_handle = 0u32;

    while let Some(body) = read_frame(&mut stream).await {
        let (id, request) = match decode_request(&body) {
            Ok(decoded) => decoded,
            Err(_) => continue,
        };

        let response = match request {
            Request::Open { path, flags, .. } => {
                state.record("open");
                let writing = flags.0 & FileOpenFlags::WRITE != 0;
                let allowed = if writing {
                    state.dirs.lock().unwrap().contains(&parent_dir(&path))
                } else {
                    state.files.lock().unwrap().contains_key(&path)
                };
                if allowed {
                    if writing {
                        state.files.lock().unwrap().insert(path.clone(), Vec::new());
                    }
                    let handle = format!("h{}", next_handle).into_bytes();
                    next_handle += 1;
                    handles.insert(handle.clone(), HandleKind::File(path));
                    state.active_handles.fetch_add(1, Ordering::SeqCst);
                    Response::Handle(handle)
                } else {
                    status(StatusCode::NoSuchFile, "No such file")
                }
            }
            Request::Close { handle } => {
                state.record("close");
                if handles.remove(&handle).is_some() {
                    state.active_handles.fetch_sub(1, Ordering::SeqCst);
                    status(StatusCode::Ok, "")
                } else {
                    status(StatusCode::Failure, "bad handle")
                }
            }
            Request::Write {
                handle,
                offset,
                data,
            } => {
                state.record("write");
                let budget_exhausted = {
                    let mut budget = state.writes_before_failure.lock().unwrap();
                    match budget.as_mut() {
                        Some(0) => true,
                        Some(remaining) => {
                            *remaining -= 1;
                            false
                        }
                        None => false,
                    }
                };
                if budget_exhausted {
                    status(StatusCode::Failure, "disk full")
                } else {
                    match handles.get(&handle) {
                        Some(HandleKind::File(path)) => {
                            let mut files = state.files.lock().unwrap();
                            let content = files.get_mut(path).expect("open handle has file");
                            let end = offset as usize + data.len();
                            if content.len() < end {
                                content.resize(end, 0);
                            }
                            content[offset as usize..end].copy_from_slice(&data);
                            status(StatusCode::Ok, "")
                        }
                        _ => status(StatusCode::Failure, "bad handle"),
                    }
                }
            }
            Request::Read {
                handle,
                offset,
                length,
            } => {
                state.record("read");
                match handles.get(&handle) {
                    Some(HandleKind::File(path)) => {
                        let files = state.files.lock().unwrap();
                        let content = files.get(path).expect("open handle has file");
                        if offset as usize >= content.len() {
                            status(StatusCode::Eof, "End of file")
                        } else {
                            let end = (offset as usize + length as usize).min(content.len());
                            Response::Data(content[offset as usize..end].to_vec())
                        }
                    }
                    _ => status(StatusCode::Failure, "bad handle"),
                }
            }
            Request::Stat { path } => {
                state.record("stat");
                let size = state.files.lock().unwrap().get(&path).map(|c| c.len());
                if let Some(size) = size {
                    Response::Attrs(FileAttributes {
                        size: Some(size as u64),
                        permissions: Some(FileMode(FileMode::DEFAULT_FILE)),
                        ..FileAttributes::default()
                    })
                } else if state.dirs.lock().unwrap().contains(&path) {
                    Response::Attrs(FileAttributes {
                        permissions: Some(FileMode(FileMode::DEFAULT_DIR)),
                        ..FileAttributes::default()
                    })
                } else {
                    status(StatusCode::NoSuchFile, "No such file")
                }
            }
            Request::MkDir { path, .. } => {
                state.record("mkdir");
                state.dirs.lock().unwrap().insert(path);
                status(StatusCode::Ok, "")
            }
            Request::RmDir { path } => {
                state.record("rmdir");
                if state.dirs.lock().unwrap().remove(&path) {
                    status(StatusCode::Ok, "")
                } else {
                    status(StatusCode::NoSuchFile, "No such file")
                }
            }
            Request::Remove { path } => {
                state.record("remove");
                if state.files.lock().unwrap().remove(&path).is_some() {
                    status(StatusCode::Ok, "")
                } else {
                    status(StatusCode::NoSuchFile, "No such file")
                }
            }
            Request::Rename { old_path, new_path } => {
                state.record("rename");
                let moved = state.files.lock().unwrap().remove(&old_path);
                match moved {
                    Some(content) => {
                        state.files.lock().unwrap().insert(new_path, content);
                        status(StatusCode::Ok, "")
                    }
                    None => status(StatusCode::NoSuchFile, "No such file"),
                }
            }
            Request::OpenDir { path } => {
                state.record("opendir");
                if state.dirs.lock().unwrap().contains(&path) {
                    let handle = format!("h{}", next_handle).into_bytes();
                    next_handle += 1;
                    handles.insert(handle.clone(), HandleKind::Dir {
                        path,
                        served: false,
                    });
                    state.active_handles.fetch_add(1, Ordering::SeqCst);
                    Response::Handle(handle)
                } else {
                    status(StatusCode::NoSuchFile, "No such file")
                }
            }
            Request::ReadDir { handle } => {
                state.record("readdir");
                match handles.get_mut(&handle) {
                    Some(HandleKind::Dir { path, served }) => {
                        if *served {
                            status(StatusCode::Eof, "End of file")
                        } else {
                            *served = true;
                            let files = state.files.lock().unwrap();
                            let entries: Vec<DirEntry> = files
                                .iter()
                                .filter(|(name, _)| parent_dir(name) == *path)
                                .map(|(name, content)| DirEntry {
                                    filename: name
                                        .rsplit_once('/')
                                        .map(|(_, base)| base.to_string())
                                        .unwrap_or_else(|| name.clone()),
                                    longname: name.clone(),
                                    attrs: FileAttributes {
                                        size: Some(content.len() as u64),
                                        ..FileAttributes::default()
                                    },
                                })
                                .collect();
                            if entries.is_empty() {
                                status(StatusCode::Eof, "End of file")
                            } else {
                                Response::Name(entries)
                            }
                        }
                    }
                    _ => status(StatusCode::Failure, "bad handle"),
                }
            }
        };

        if stream.write_all(&response.encode(id)).await.is_err() {
            return;
        }
    }
}

/// Hands out one pre-built channel; further opens fail.
struct FixedChannelProvider {
    channel: Mutex<Option<DuplexChannel>>,
}

#[async_trait::async_trait]
impl ChannelProvider for FixedChannelProvider {
    async fn open(&self, _config: &SessionConfig) -> SkiffResult<DuplexChannel> {
        self.channel
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SkiffError::Connection("channel already taken".to_string()))
    }
}

/// Starts a mock server and returns a client connected to it.
pub async fn connect(state: Arc<MockState>) -> SftpClient {
    connect_with_max_inflight(state, DEFAULT_MAX_INFLIGHT).await
}

/// Like [`connect`], with an explicit in-flight request cap.
pub async fn connect_with_max_inflight(state: Arc<MockState>, max_inflight: usize) -> SftpClient {
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
    tokio::spawn(serve(server_stream, state));

    let provider = FixedChannelProvider {
        channel: Mutex::new(Some(Box::new(client_stream) as DuplexChannel)),
    };
    let config = SessionConfig::new("mock")
        .with_connect_timeout(Duration::from_secs(2))
        .with_handshake_timeout(Duration::from_secs(2))
        .with_max_inflight(max_inflight);

    SftpClient::connect_with_provider(&provider, config)
        .await
        .expect("mock connect")
}
