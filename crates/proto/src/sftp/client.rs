//! File-transfer client.
//!
//! The public surface consumed by applications: connect, put/get transfers,
//! and the path operations (stat, mkdir, rmdir, rename, remove, list). All
//! operations are `async` and report failures through [`SkiffResult`];
//! nothing panics on remote errors.
//!
//! # Example
//!
//! ```rust,no_run
//! use skiff_proto::sftp::{SessionConfig, SftpClient, TransferOptions};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::new("files.example.net").with_port(2022);
//! let mut client = SftpClient::connect(config).await?;
//!
//! let dest = client
//!     .put(b"hello".as_slice(), "/upload/hello.txt", TransferOptions::new())
//!     .await?;
//! println!("uploaded to {}", dest);
//!
//! client.end().await?;
//! # Ok(())
//! # }
//! ```

use super::channel::{ChannelProvider, TcpChannelProvider};
use super::message::{Request, Response};
use super::session::{normalize_status, Session, SessionConfig, SessionState};
use super::transfer::{self, GetOutcome, GetTarget, PutSource, TransferOptions};
use super::types::{DirEntry, FileAttributes, FileMode, StatusCode};
use skiff_platform::{SkiffError, SkiffResult};
use tracing::debug;

/// File-transfer client over a provided secure channel.
pub struct SftpClient {
    session: Session,
}

impl SftpClient {
    /// Connects over plain TCP.
    ///
    /// Only suitable where the transport is secured externally; production
    /// callers supply their own authenticated provider via
    /// [`connect_with_provider`](Self::connect_with_provider).
    pub async fn connect(config: SessionConfig) -> SkiffResult<Self> {
        Self::connect_with_provider(&TcpChannelProvider::new(), config).await
    }

    /// Connects using `provider` to obtain the session channel.
    pub async fn connect_with_provider(
        provider: &dyn ChannelProvider,
        config: SessionConfig,
    ) -> SkiffResult<Self> {
        let session = Session::connect(provider, config).await?;
        Ok(Self { session })
    }

    /// Returns the session state.
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Uploads `source` to `remote`, resolving to the destination path.
    ///
    /// The source may be a local path, an in-memory buffer, or a readable
    /// stream; see [`PutSource`]. A missing local source fails before any
    /// remote request is issued.
    pub async fn put(
        &self,
        source: impl Into<PutSource>,
        remote: &str,
        options: TransferOptions,
    ) -> SkiffResult<String> {
        transfer::put(self.session.mux()?, source.into(), remote, options).await
    }

    /// Downloads `remote` into `target`.
    pub async fn get(
        &self,
        remote: &str,
        target: GetTarget,
        options: TransferOptions,
    ) -> SkiffResult<GetOutcome> {
        transfer::get(self.session.mux()?, remote, target, options).await
    }

    /// Downloads `remote` and returns its content.
    pub async fn get_buffer(&self, remote: &str) -> SkiffResult<Vec<u8>> {
        match self
            .get(remote, GetTarget::Buffer, TransferOptions::new())
            .await?
        {
            GetOutcome::Buffer(data) => Ok(data),
            other => Err(SkiffError::Protocol(format!(
                "Buffer target produced {:?}",
                other
            ))),
        }
    }

    /// Returns the attributes of the file at `path`.
    pub async fn stat(&self, path: &str) -> SkiffResult<FileAttributes> {
        let reply = self
            .session
            .mux()?
            .submit(Request::Stat {
                path: path.to_string(),
            })
            .await?;

        match reply.recv().await? {
            Response::Attrs(attrs) => Ok(attrs),
            Response::Status { code, message } => {
                Err(normalize_status("stat", path, code, &message))
            }
            other => Err(SkiffError::Protocol(format!(
                "Unexpected response to Stat: {:?}",
                other
            ))),
        }
    }

    /// Creates the directory at `path`.
    pub async fn mkdir(&self, path: &str) -> SkiffResult<()> {
        let request = Request::MkDir {
            path: path.to_string(),
            attrs: FileAttributes::with_permissions(FileMode::DEFAULT_DIR),
        };
        self.expect_ok("mkdir", path, request).await
    }

    /// Removes the directory at `path`.
    pub async fn rmdir(&self, path: &str) -> SkiffResult<()> {
        let request = Request::RmDir {
            path: path.to_string(),
        };
        self.expect_ok("rmdir", path, request).await
    }

    /// Renames `from` to `to`.
    pub async fn rename(&self, from: &str, to: &str) -> SkiffResult<()> {
        let request = Request::Rename {
            old_path: from.to_string(),
            new_path: to.to_string(),
        };
        self.expect_ok("rename", from, request).await
    }

    /// Removes the file at `path`.
    pub async fn remove(&self, path: &str) -> SkiffResult<()> {
        let request = Request::Remove {
            path: path.to_string(),
        };
        self.expect_ok("remove", path, request).await
    }

    /// Lists the directory at `path`.
    pub async fn list(&self, path: &str) -> SkiffResult<Vec<DirEntry>> {
        let mux = self.session.mux()?;

        let reply = mux
            .submit(Request::OpenDir {
                path: path.to_string(),
            })
            .await?;
        let handle = match reply.recv().await? {
            Response::Handle(handle) => handle,
            Response::Status { code, message } => {
                return Err(normalize_status("list", path, code, &message));
            }
            other => {
                return Err(SkiffError::Protocol(format!(
                    "Unexpected response to OpenDir: {:?}",
                    other
                )));
            }
        };

        let mut entries = Vec::new();
        let result = loop {
            let reply = match mux
                .submit(Request::ReadDir {
                    handle: handle.clone(),
                })
                .await
            {
                Ok(reply) => reply,
                Err(e) => break Err(e),
            };

            match reply.recv().await {
                Ok(Response::Name(batch)) => entries.extend(batch),
                Ok(Response::Status {
                    code: StatusCode::Eof,
                    ..
                }) => break Ok(()),
                Ok(Response::Status { code, message }) => {
                    break Err(normalize_status("list", path, code, &message));
                }
                Ok(other) => {
                    break Err(SkiffError::Protocol(format!(
                        "Unexpected response to ReadDir: {:?}",
                        other
                    )));
                }
                Err(e) => break Err(e),
            }
        };

        // The directory handle is released exactly once, also when a read
        // batch failed.
        let close_result = async {
            let reply = mux.submit(Request::Close { handle }).await?;
            reply.recv().await
        }
        .await;
        if let Err(e) = &close_result {
            debug!("list {}: close: {}", path, e);
        }

        result.map(|_| entries)
    }

    /// Ends the session, failing every pending operation with
    /// [`SkiffError::SessionClosed`]. Idempotent.
    pub async fn end(&mut self) -> SkiffResult<()> {
        self.session.end().await
    }

    async fn expect_ok(&self, op: &str, path: &str, request: Request) -> SkiffResult<()> {
        let reply = self.session.mux()?.submit(request).await?;
        match reply.recv().await? {
            Response::Status {
                code: StatusCode::Ok,
                ..
            } => Ok(()),
            Response::Status { code, message } => Err(normalize_status(op, path, code, &message)),
            other => Err(SkiffError::Protocol(format!(
                "Unexpected response to {}: {:?}",
                op, other
            ))),
        }
    }
}
